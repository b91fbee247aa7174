use std::future::Future;
use std::pin::Pin;

use crate::logging::{DatabaseLogger, Event};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// 事件存储抽象（默认 SQLite）
pub trait EventStore: Send + Sync {
    fn store_event<'a>(&'a self, event: Event) -> BoxFuture<'a, rusqlite::Result<i64>>;
}

// 被标记提示词的短期存储，供人工复核
pub trait PromptRecorder: Send + Sync {
    fn record<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, crate::error::Result<()>>;
}

impl EventStore for DatabaseLogger {
    fn store_event<'a>(&'a self, event: Event) -> BoxFuture<'a, rusqlite::Result<i64>> {
        Box::pin(async move { self.insert_event(&event).await })
    }
}
