// src/storage/memory.rs

//! In-memory object storage, used by tests. Blobs only become visible at
//! commit time, same as every other driver.

use super::{BlobWriter, Store};
use crate::core::BeskarError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

#[derive(Default)]
pub struct MemoryStore {
    blobs: Arc<DashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, BeskarError> {
        self.blobs
            .get(key)
            .map(|b| b.value().to_vec())
            .ok_or_else(|| BeskarError::NotFound(format!("blob '{key}' does not exist")))
    }

    async fn put(&self, key: &str) -> Result<Box<dyn BlobWriter>, BeskarError> {
        Ok(Box::new(MemoryWriter {
            key: key.to_string(),
            buf: Vec::new(),
            blobs: self.blobs.clone(),
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), BeskarError> {
        self.blobs.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, BeskarError> {
        Ok(self.blobs.contains_key(key))
    }
}

struct MemoryWriter {
    key: String,
    buf: Vec<u8>,
    blobs: Arc<DashMap<String, Bytes>>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        self.get_mut().buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl BlobWriter for MemoryWriter {
    async fn commit(self: Box<Self>) -> Result<(), BeskarError> {
        let writer = *self;
        writer.blobs.insert(writer.key, Bytes::from(writer.buf));
        Ok(())
    }
}
