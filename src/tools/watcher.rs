//! 工具目录监听
//!
//! 监听工具模块目录的创建 / 修改 / 删除事件（500ms 去抖），把变更路径映射为模块 id 后经 channel 发出。
//! 同一批事件里的重复模块只发送一次。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify_debouncer_full::notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tokio::sync::mpsc;

use crate::core::LoaderError;

const DEBOUNCE: Duration = Duration::from_millis(500);

/// 持有去抖监听器；drop 即停止监听
pub struct ToolWatcher {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    dir: PathBuf,
}

impl ToolWatcher {
    /// 开始监听 dir；`resolve` 把事件路径映射为模块 id（不属于任何模块时返回 None）
    pub fn start<F>(dir: &Path, resolve: F) -> Result<(Self, mpsc::UnboundedReceiver<String>), LoaderError>
    where
        F: Fn(&Path) -> Option<String> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| match result {
            Ok(events) => {
                let mut changed = BTreeSet::new();
                for event in events {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        continue;
                    }
                    for path in &event.paths {
                        if let Some(id) = resolve(path) {
                            tracing::debug!(path = %path.display(), module = %id, "tool watcher event");
                            changed.insert(id);
                        }
                    }
                }
                for id in changed {
                    let _ = tx.send(id);
                }
            }
            Err(errors) => {
                for e in errors {
                    tracing::warn!(error = %e, "tool watcher error");
                }
            }
        })
        .map_err(|e| LoaderError::Watch(e.to_string()))?;

        debouncer
            .watch(dir, RecursiveMode::Recursive)
            .map_err(|e| LoaderError::Watch(e.to_string()))?;
        tracing::info!(dir = %dir.display(), "tool watcher: watching directory");

        Ok((
            Self {
                _debouncer: debouncer,
                dir: dir.to_path_buf(),
            },
            rx,
        ))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
