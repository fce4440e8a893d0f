use beskar::repository::event::{Action, Event, EventEnvelope};

fn sample_event() -> Event {
    Event {
        digest: "sha256:0123abcd".to_string(),
        action: Action::Put,
        repository: "artifacts/static/test".to_string(),
        payload: br#"{"schemaVersion":2}"#.to_vec(),
    }
}

#[test]
fn test_event_id_format() {
    let event = sample_event();
    assert_eq!(event.id(), "sha256:0123abcd:put");

    let delete = Event {
        action: Action::Delete,
        ..sample_event()
    };
    assert_eq!(delete.id(), "sha256:0123abcd:delete");
}

#[test]
fn test_action_parse_roundtrip() {
    for action in [Action::Put, Action::Delete, Action::Start, Action::Stop] {
        assert_eq!(Action::parse(action.as_str()), Some(action));
    }
    assert_eq!(Action::parse("unknown"), None);
}

#[test]
fn test_envelope_framed_roundtrip() {
    let event = sample_event();
    let framed = EventEnvelope::from_event(&event).encode_framed().unwrap();

    // 4-byte big-endian length prefix covers the rest of the message.
    let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
    assert_eq!(len, framed.len() - 4);

    let decoded = EventEnvelope::decode_framed(&framed).unwrap().into_event();
    assert_eq!(decoded, event);
}

#[test]
fn test_envelope_truncated_rejected() {
    let event = sample_event();
    let framed = EventEnvelope::from_event(&event).encode_framed().unwrap();

    assert!(EventEnvelope::decode_framed(&framed[..2]).is_err());
    assert!(EventEnvelope::decode_framed(&framed[..framed.len() - 1]).is_err());
}
