//! 按 key 前缀去重的 watch 管理

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::instance::MicroserviceInstance;
use crate::registry::microservice::Microservice;

const UPDATE_CAPACITY: usize = 16;

/// 一次刷新读到的前缀下完整内容
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchUpdate {
    pub instances: Vec<MicroserviceInstance>,
    pub microservices: Vec<Microservice>,
}

/// 交给 watch 任务的发布端
#[derive(Debug, Clone)]
pub struct WatchFeed {
    cancel: CancellationToken,
    updates: broadcast::Sender<Arc<WatchUpdate>>,
}

impl WatchFeed {
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 推送给所有订阅者，返回收到的订阅者数量
    pub fn publish(&self, update: WatchUpdate) -> usize {
        self.updates.send(Arc::new(update)).unwrap_or(0)
    }
}

/// 一条 watch 流的句柄
///
/// 共享同一前缀的每个持有者各自 [`subscribe`](Self::subscribe)，都会收到 watch 推送。
#[derive(Debug)]
pub struct WatchHandle {
    prefix: String,
    refs: AtomicUsize,
    feed: WatchFeed,
}

impl WatchHandle {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.feed.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<WatchUpdate>> {
        self.feed.updates.subscribe()
    }
}

/// watch 管理器
///
/// 每个前缀最多一条 watch 流。检查与创建在同一个 map 分片锁内完成，
/// 并发的首次调用只会触发一次 `start`。
#[derive(Debug, Default)]
pub struct WatchManager {
    watches: DashMap<String, Arc<WatchHandle>>,
}

impl WatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取前缀对应的 watch，不存在时调用 `start` 创建
    ///
    /// `start` 在分片锁内执行，只能做非阻塞的工作（例如 `tokio::spawn`）。
    pub fn acquire<F>(&self, prefix: &str, start: F) -> Arc<WatchHandle>
    where
        F: FnOnce(&str, WatchFeed),
    {
        let entry = self.watches.entry(prefix.to_string()).or_insert_with(|| {
            let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
            let feed = WatchFeed {
                cancel: CancellationToken::new(),
                updates,
            };
            start(prefix, feed.clone());
            info!(prefix = %prefix, "Watch created");
            Arc::new(WatchHandle {
                prefix: prefix.to_string(),
                refs: AtomicUsize::new(0),
                feed,
            })
        });
        entry.refs.fetch_add(1, Ordering::SeqCst);
        entry.value().clone()
    }

    /// 释放一次引用，最后一个引用释放时取消 watch
    pub fn release(&self, prefix: &str) {
        if let Entry::Occupied(entry) = self.watches.entry(prefix.to_string()) {
            if entry.get().refs.fetch_sub(1, Ordering::SeqCst) <= 1 {
                entry.get().feed.cancel.cancel();
                entry.remove();
                debug!(prefix = %prefix, "Watch cancelled");
            }
        }
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.watches.contains_key(prefix)
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// 取消全部 watch
    pub fn shutdown(&self) {
        for entry in self.watches.iter() {
            entry.feed.cancel.cancel();
        }
        self.watches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_release_cancels() {
        let manager = WatchManager::new();
        let first = manager.acquire("/a/", |_, _| {});
        let second = manager.acquire("/a/", |_, _| panic!("watch started twice"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.ref_count(), 2);

        manager.release("/a/");
        assert!(!first.is_cancelled());
        manager.release("/a/");
        assert!(first.is_cancelled());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn every_holder_receives_updates() {
        let manager = WatchManager::new();
        let mut feed = None;
        let first = manager.acquire("/a/", |_, f| feed = Some(f));
        let second = manager.acquire("/a/", |_, _| panic!("watch started twice"));
        let feed = feed.unwrap();

        let mut first_rx = first.subscribe();
        let mut second_rx = second.subscribe();
        let update = WatchUpdate {
            instances: vec![MicroserviceInstance::new("host")],
            microservices: Vec::new(),
        };
        assert_eq!(feed.publish(update.clone()), 2);
        assert_eq!(*first_rx.recv().await.unwrap(), update);
        assert_eq!(*second_rx.recv().await.unwrap(), update);

        // 创建者释放后，剩余持有者仍能收到推送
        drop(first_rx);
        manager.release("/a/");
        assert!(!feed.is_cancelled());
        assert_eq!(feed.publish(WatchUpdate::default()), 1);
        assert!(second_rx.recv().await.unwrap().instances.is_empty());
    }
}
