use beskar::oci::content_tag;
use beskar::repository::event::{Action, Event};
use beskar::repository::queue::EventQueue;
use proptest::prelude::*;

proptest! {
    /// The content tag is a stable 32-character hex key for any name.
    #[test]
    fn content_tag_is_stable_hex(name in ".{0,64}") {
        let tag = content_tag(&name);
        prop_assert_eq!(tag.len(), 32);
        prop_assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
        prop_assert_eq!(tag, content_tag(&name));
    }

    /// Different names map to different tags for ordinary inputs.
    #[test]
    fn content_tag_distinguishes_names(a in "[a-z]{1,16}", b in "[a-z]{1,16}") {
        if a != b {
            prop_assert_ne!(content_tag(&a), content_tag(&b));
        }
    }

    /// Swap-all dequeue preserves enqueue order for any event sequence.
    #[test]
    fn queue_preserves_fifo_order(digests in proptest::collection::vec("[a-f0-9]{8}", 0..50)) {
        let (queue, _wake_rx) = EventQueue::new();
        for digest in &digests {
            queue.push(Event {
                digest: digest.clone(),
                action: Action::Put,
                repository: "r".to_string(),
                payload: vec![],
            });
        }
        let drained: Vec<String> = queue.drain().into_iter().map(|e| e.digest).collect();
        prop_assert_eq!(drained, digests);
        prop_assert!(queue.is_empty());
    }
}
