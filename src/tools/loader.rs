//! 工具模块加载器（支持热重载）
//!
//! 模块目录下 `<id>.toml` 是单文件模块，`<id>/module.toml` 是包模块；以 `_` 或 `.` 开头的名字被忽略。
//! 每个模块记录一个变更标记（文件 mtime；包模块取目录内最新的 mtime；内置模块取版本号），
//! 标记未变化时 `load` 不做任何事。加载失败只影响该模块本身：记录日志、注销该模块、返回 false。
//!
//! 新版本通过 `ToolRegistry::replace_module` 在一次写锁内替换旧版本。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::AppConfig;
use crate::core::{panic_message, LoaderError};

use super::manifest::{ManifestModule, ModuleManifest, MODULE_MANIFEST};
use super::module::ToolModule;
use super::registry::ToolRegistry;
use super::watcher::ToolWatcher;

/// 热重载回调：(模块 id, 是否成功)
pub type ReloadCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// 模块变更标记
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleMarker {
    Mtime(SystemTime),
    Version(String),
}

impl ModuleMarker {
    fn unchanged_since(&self, previous: &ModuleMarker) -> bool {
        match (self, previous) {
            (ModuleMarker::Mtime(now), ModuleMarker::Mtime(before)) => now <= before,
            (ModuleMarker::Version(now), ModuleMarker::Version(before)) => now == before,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ModuleOrigin {
    /// 模块根路径（单文件或包目录）
    Manifest(PathBuf),
    Builtin,
}

struct LoadedModule {
    module: Arc<dyn ToolModule>,
    marker: ModuleMarker,
    origin: ModuleOrigin,
}

struct WatchHandle {
    _watcher: ToolWatcher,
    cancel: CancellationToken,
}

/// 工具模块加载器
pub struct ToolLoader {
    dir: PathBuf,
    workspace: PathBuf,
    default_timeout: Duration,
    registry: Arc<ToolRegistry>,
    /// 持锁期间完成整个加载流程，同一时刻只有一个加载在进行
    loaded: tokio::sync::Mutex<HashMap<String, LoadedModule>>,
    callbacks: RwLock<Vec<ReloadCallback>>,
    watch: Mutex<Option<WatchHandle>>,
}

impl ToolLoader {
    pub fn new(registry: Arc<ToolRegistry>, dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            workspace: PathBuf::from("workspace"),
            default_timeout: Duration::from_secs(30),
            registry,
            loaded: tokio::sync::Mutex::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            watch: Mutex::new(None),
        }
    }

    pub fn from_config(registry: Arc<ToolRegistry>, cfg: &AppConfig) -> Self {
        Self::new(registry, cfg.tools.dir.clone())
            .with_workspace(cfg.app.workspace())
            .with_timeout(Duration::from_secs(cfg.tools.tool_timeout_secs))
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// 工具进程的默认超时（清单中未指定 timeout_secs 时使用）
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 扫描模块目录，返回排序后的模块 id
    pub fn discover(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "tool module directory unreadable");
                return Vec::new();
            }
        };

        let mut ids = BTreeSet::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if is_hidden(name) {
                continue;
            }
            if path.is_file() {
                if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        ids.insert(stem.to_string());
                    }
                }
            } else if path.join(MODULE_MANIFEST).is_file() {
                ids.insert(name.to_string());
            }
        }
        ids.into_iter().collect()
    }

    /// (清单文件, 模块根路径)；单文件优先于同名包目录
    fn locate(&self, module_id: &str) -> Option<(PathBuf, PathBuf)> {
        if module_id.is_empty() || is_hidden(module_id) {
            return None;
        }
        let file = self.dir.join(format!("{}.toml", module_id));
        if file.is_file() {
            return Some((file.clone(), file));
        }
        let package = self.dir.join(module_id);
        let manifest = package.join(MODULE_MANIFEST);
        manifest.is_file().then_some((manifest, package))
    }

    /// 加载模块；标记未变化时直接返回 true
    pub async fn load(&self, module_id: &str) -> bool {
        let mut loaded = self.loaded.lock().await;
        self.load_locked(&mut loaded, module_id, false).await
    }

    /// 强制重新加载，然后通知所有回调
    pub async fn reload(&self, module_id: &str) -> bool {
        let success = {
            let mut loaded = self.loaded.lock().await;
            self.load_locked(&mut loaded, module_id, true).await
        };
        self.notify(module_id, success);
        success
    }

    /// 加载编译进二进制的模块，模块名即模块 id，版本号作为变更标记
    pub async fn load_builtin(&self, module: Arc<dyn ToolModule>) -> bool {
        let id = module.name().to_string();
        let marker = ModuleMarker::Version(module.version().to_string());
        let mut loaded = self.loaded.lock().await;

        if let Some(prev) = loaded.get(&id) {
            if prev.origin == ModuleOrigin::Builtin && marker.unchanged_since(&prev.marker) {
                return true;
            }
            let old = Arc::clone(&prev.module);
            cleanup_module(&id, &old).await;
        }
        self.activate(&mut loaded, &id, module, marker, ModuleOrigin::Builtin)
            .await
    }

    async fn load_locked(
        &self,
        loaded: &mut HashMap<String, LoadedModule>,
        module_id: &str,
        force: bool,
    ) -> bool {
        if let Some(prev) = loaded.get(module_id) {
            if prev.origin == ModuleOrigin::Builtin {
                if !force {
                    return true;
                }
                let module = Arc::clone(&prev.module);
                let marker = prev.marker.clone();
                cleanup_module(module_id, &module).await;
                return self
                    .activate(loaded, module_id, module, marker, ModuleOrigin::Builtin)
                    .await;
            }
        }

        let Some((manifest_path, root)) = self.locate(module_id) else {
            self.fail(loaded, module_id, LoaderError::NotFound(module_id.to_string()))
                .await;
            return false;
        };

        let marker = match read_marker(&root) {
            Ok(marker) => marker,
            Err(e) => {
                self.fail(loaded, module_id, e).await;
                return false;
            }
        };

        if let Some(prev) = loaded.get(module_id) {
            if !force && marker.unchanged_since(&prev.marker) {
                tracing::debug!(module = %module_id, "tool module unchanged");
                return true;
            }
            let old = Arc::clone(&prev.module);
            cleanup_module(module_id, &old).await;
        }

        let module: Arc<dyn ToolModule> = match ModuleManifest::load(module_id, &manifest_path) {
            Ok(manifest) => Arc::new(ManifestModule::new(
                module_id,
                manifest,
                self.workspace.clone(),
                self.default_timeout,
            )),
            Err(e) => {
                self.fail(loaded, module_id, e).await;
                return false;
            }
        };

        self.activate(loaded, module_id, module, marker, ModuleOrigin::Manifest(root))
            .await
    }

    async fn activate(
        &self,
        loaded: &mut HashMap<String, LoadedModule>,
        module_id: &str,
        module: Arc<dyn ToolModule>,
        marker: ModuleMarker,
        origin: ModuleOrigin,
    ) -> bool {
        match self.register_module(module_id, &module).await {
            Ok(count) => {
                tracing::info!(
                    module = %module_id,
                    version = %module.version(),
                    tools = count,
                    "tool module loaded"
                );
                loaded.insert(
                    module_id.to_string(),
                    LoadedModule {
                        module,
                        marker,
                        origin,
                    },
                );
                true
            }
            Err(e) => {
                self.fail(loaded, module_id, e).await;
                false
            }
        }
    }

    async fn register_module(
        &self,
        module_id: &str,
        module: &Arc<dyn ToolModule>,
    ) -> Result<usize, LoaderError> {
        let tools = std::panic::catch_unwind(AssertUnwindSafe(|| module.tools()))
            .map_err(|_| LoaderError::Panicked(module_id.to_string()))?;
        if tools.is_empty() {
            return Err(LoaderError::NoTools(module_id.to_string()));
        }
        let mut names = HashSet::new();
        if let Some(dup) = tools.iter().find(|t| !names.insert(t.name.as_str())) {
            return Err(LoaderError::DuplicateTool {
                module: module_id.to_string(),
                name: dup.name.clone(),
            });
        }

        match AssertUnwindSafe(module.initialize()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(LoaderError::Initialize {
                    module: module_id.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(LoaderError::Panicked(module_id.to_string())),
        }

        let count = tools.len();
        let prompt = module.system_prompt();
        if let Err(e) = self
            .registry
            .replace_module(module_id, tools, prompt.as_deref())
            .await
        {
            // 已初始化的新版本不会被注册，撤销其初始化
            cleanup_module(module_id, module).await;
            return Err(e.into());
        }
        Ok(count)
    }

    /// 加载失败：记录日志并确保模块不再注册
    async fn fail(&self, loaded: &mut HashMap<String, LoadedModule>, module_id: &str, error: LoaderError) {
        tracing::error!(module = %module_id, error = %error, "tool module load failed");
        loaded.remove(module_id);
        self.registry.unregister_module(module_id).await;
    }

    fn notify(&self, module_id: &str, success: bool) {
        let callbacks: Vec<ReloadCallback> = self
            .callbacks
            .read()
            .map(|c| c.clone())
            .unwrap_or_default();
        for callback in callbacks {
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(module_id, success))) {
                tracing::warn!(
                    module = %module_id,
                    panic = %panic_message(payload.as_ref()),
                    "reload callback panicked"
                );
            }
        }
    }

    /// 注册热重载回调
    pub fn on_reload<F>(&self, callback: F)
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.push(Arc::new(callback));
        }
    }

    /// 卸载模块（运行 cleanup 并注销全部工具）；模块未加载时返回 false
    pub async fn unload(&self, module_id: &str) -> bool {
        let mut loaded = self.loaded.lock().await;
        let Some(prev) = loaded.remove(module_id) else {
            return false;
        };
        cleanup_module(module_id, &prev.module).await;
        let removed = self.registry.unregister_module(module_id).await;
        tracing::info!(module = %module_id, tools = removed.len(), "tool module unloaded");
        true
    }

    /// 加载目录下所有模块，返回成功数量
    pub async fn load_all(&self) -> usize {
        let ids = self.discover();
        let mut ok = 0;
        for id in &ids {
            if self.load(id).await {
                ok += 1;
            }
        }
        tracing::info!(discovered = ids.len(), loaded = ok, "tool modules loaded");
        ok
    }

    /// 重新加载所有已知模块（目录中的与已加载的），返回成功数量
    pub async fn reload_all(&self) -> usize {
        let mut ids: BTreeSet<String> = self.discover().into_iter().collect();
        ids.extend(self.loaded.lock().await.keys().cloned());
        let mut ok = 0;
        for id in &ids {
            if self.reload(id).await {
                ok += 1;
            }
        }
        ok
    }

    /// 已加载模块：id -> 版本
    pub async fn loaded_modules(&self) -> BTreeMap<String, String> {
        self.loaded
            .lock()
            .await
            .iter()
            .map(|(id, m)| (id.clone(), m.module.version().to_string()))
            .collect()
    }

    /// 将模块目录内的路径映射为模块 id
    pub fn module_for_path(&self, path: &Path) -> Option<String> {
        module_id_for_path(&self.dir, path)
    }

    /// 监听模块目录，变更时在后台任务中调用 reload；模块文件被删除时卸载
    pub fn start_watching(self: &Arc<Self>) -> Result<(), LoaderError> {
        let root = self.dir.canonicalize().map_err(|source| LoaderError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let resolve_root = root.clone();
        let (watcher, mut rx) =
            ToolWatcher::start(&root, move |path| module_id_for_path(&resolve_root, path))?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let module_id = tokio::select! {
                    _ = token.cancelled() => break,
                    id = rx.recv() => match id {
                        Some(id) => id,
                        None => break,
                    },
                };
                let Some(loader) = weak.upgrade() else {
                    break;
                };
                loader.handle_change(&module_id).await;
            }
            tracing::debug!("tool watcher task stopped");
        });

        let previous = self
            .watch
            .lock()
            .map_err(|_| LoaderError::Watch("watch state poisoned".to_string()))?
            .replace(WatchHandle {
                _watcher: watcher,
                cancel,
            });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        Ok(())
    }

    async fn handle_change(&self, module_id: &str) {
        if self.locate(module_id).is_none() {
            self.unload(module_id).await;
            return;
        }
        let ok = self.reload(module_id).await;
        tracing::info!(module = %module_id, success = ok, "tool module hot reloaded");
    }

    pub fn is_watching(&self) -> bool {
        self.watch.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    pub fn stop_watching(&self) {
        let handle = self.watch.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            handle.cancel.cancel();
            tracing::info!(dir = %self.dir.display(), "tool watcher stopped");
        }
    }

    /// 停止监听并卸载全部模块
    pub async fn shutdown(&self) {
        self.stop_watching();
        let mut loaded = self.loaded.lock().await;
        for (id, module) in loaded.drain() {
            cleanup_module(&id, &module.module).await;
            self.registry.unregister_module(&id).await;
        }
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('_') || name.starts_with('.')
}

/// 运行 cleanup 钩子，失败或 panic 只记录日志
async fn cleanup_module(module_id: &str, module: &Arc<dyn ToolModule>) {
    match AssertUnwindSafe(module.cleanup()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(module = %module_id, error = %e, "tool module cleanup failed"),
        Err(payload) => tracing::warn!(
            module = %module_id,
            panic = %panic_message(payload.as_ref()),
            "tool module cleanup panicked"
        ),
    }
}

/// 单文件取自身 mtime，包目录取其中最新文件的 mtime
fn read_marker(root: &Path) -> Result<ModuleMarker, LoaderError> {
    let io_err = |source: std::io::Error| LoaderError::Io {
        path: root.to_path_buf(),
        source,
    };

    if root.is_file() {
        let modified = std::fs::metadata(root)
            .and_then(|m| m.modified())
            .map_err(io_err)?;
        return Ok(ModuleMarker::Mtime(modified));
    }

    let mut newest = SystemTime::UNIX_EPOCH;
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| io_err(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .map_err(|e| io_err(e.into()))?
            .modified()
            .map_err(io_err)?;
        newest = newest.max(modified);
    }
    Ok(ModuleMarker::Mtime(newest))
}

/// `root/<id>.toml` 或 `root/<id>/...` -> id
pub fn module_id_for_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let first = components.next()?.as_os_str().to_str()?;
    if is_hidden(first) {
        return None;
    }
    if components.next().is_some() {
        return Some(first.to_string());
    }

    let top = Path::new(first);
    match top.extension().and_then(|e| e.to_str()) {
        Some("toml") => top.file_stem().and_then(|s| s.to_str()).map(str::to_string),
        // 无扩展名的顶层条目视为包目录本身（可能已被删除）
        None => Some(first.to_string()),
        Some(_) => None,
    }
}
