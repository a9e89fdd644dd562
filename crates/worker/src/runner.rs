//! # 任务Runner
//!
//! 一个Runner独占一个执行中的任务: 同步爬虫文件、在独立进程组里拉起
//! 子进程、把stdout按IPC行协议复用为抓取记录与日志、stderr全量转日志、
//! 监控进程与上行流健康，结束后写终态并汇总统计。
//!
//! 取消是协作式的: 所有监控协程观察同一个取消标记；无论协程是否按时
//! 退出，清理路径都会对整个进程组补刀并扫描孤儿进程，保证Runner返回
//! 后不留任何子进程。

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crawler_common::{
    split_command, ENV_PREFIX, PARENT_PID_ENV_KEY, SYSTEM_USER, TASK_ID_ENV_KEY,
};
use crawler_domain::{DependencyInstaller, Notifier, Spider, Store, Task, TaskStatus};
use crawler_errors::{CrawlerError, CrawlerResult};
use crawler_protocol::{ConnectCode, ConnectFrame};

use crate::client::UplinkStream;
use crate::connection::ConnectionSupervisor;
use crate::ipc::{normalize_payload, parse_ipc_line};
use crate::sync::FileSyncClient;

/// 上行流重连上限
const MAX_UPLINK_RECONNECTS: u32 = 10;
/// 取消时的进程状态轮询间隔
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Runner行为配置
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub workspace: PathBuf,
    pub is_master: bool,
    pub api_endpoint: String,
    pub auth_key: String,
    /// 注入子进程PATH的工具目录（Python/Node/Go等运行时）
    pub tool_paths: Vec<PathBuf>,
    pub cancel_timeout: Duration,
    pub terminate_grace: Duration,
    pub process_health_interval: Duration,
    pub conn_health_interval: Duration,
    pub zombie_check_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("./workspace"),
            is_master: false,
            api_endpoint: String::new(),
            auth_key: String::new(),
            tool_paths: Vec::new(),
            cancel_timeout: Duration::from_secs(60),
            terminate_grace: Duration::from_secs(15),
            process_health_interval: Duration::from_secs(5),
            conn_health_interval: Duration::from_secs(60),
            zombie_check_interval: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(600),
        }
    }
}

/// 任务内部信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskSignal {
    /// 退出码0
    Finish,
    /// 被信号杀死（取消路径）
    Cancel,
    /// 非零退出码或wait错误
    Error,
    /// 进程在wait之外消失
    Lost,
}

pub struct TaskRunner {
    store: Store,
    supervisor: Arc<ConnectionSupervisor>,
    notifier: Arc<dyn Notifier>,
    installer: Option<Arc<dyn DependencyInstaller>>,
    config: RunnerConfig,

    task_id: String,
    spider: Spider,
    cwd: PathBuf,

    pid: AtomicI64,
    exit_error: std::sync::Mutex<String>,
    uplink: Mutex<Option<UplinkStream>>,
    uplink_healthy: AtomicBool,

    signal_tx: mpsc::Sender<TaskSignal>,
    signal_rx: Mutex<Option<mpsc::Receiver<TaskSignal>>>,
    cancel_tx: watch::Sender<bool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRunner {
    /// 加载任务与爬虫，构造Runner
    pub async fn new(
        task_id: &str,
        store: Store,
        supervisor: Arc<ConnectionSupervisor>,
        notifier: Arc<dyn Notifier>,
        config: RunnerConfig,
    ) -> CrawlerResult<Arc<Self>> {
        let task = store
            .tasks
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| CrawlerError::task_not_found(task_id))?;
        let spider = store
            .spiders
            .get_by_id(&task.spider_id)
            .await?
            .ok_or_else(|| CrawlerError::spider_not_found(&task.spider_id))?;

        let cwd = config.workspace.join(spider.workspace_rel_path());
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let (cancel_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            store,
            supervisor,
            notifier,
            installer: None,
            config,
            task_id: task_id.to_string(),
            spider,
            cwd,
            pid: AtomicI64::new(0),
            exit_error: std::sync::Mutex::new(String::new()),
            uplink: Mutex::new(None),
            uplink_healthy: AtomicBool::new(false),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            cancel_tx,
            handles: std::sync::Mutex::new(Vec::new()),
        }))
    }

    /// 注入依赖安装器插件
    pub fn with_installer(self: Arc<Self>, installer: Arc<dyn DependencyInstaller>) -> Arc<Self> {
        let mut runner = Arc::try_unwrap(self)
            .ok()
            .expect("安装器必须在Runner共享前注入");
        runner.installer = Some(installer);
        Arc::new(runner)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn pid(&self) -> i64 {
        self.pid.load(Ordering::SeqCst)
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// 执行任务直到终态，返回最终状态
    pub async fn run(self: &Arc<Self>) -> CrawlerResult<TaskStatus> {
        info!("任务开始执行: {}", self.task_id);

        // 上行流尽力建立: 连不上也继续执行，日志丢弃到重连成功为止
        self.init_uplink().await;

        self.update_task_status(TaskStatus::Running, "").await?;

        // 工作节点先同步爬虫文件
        if !self.config.is_master {
            if let Err(e) = self.sync_files().await {
                error!("任务 {} 文件同步失败: {}", self.task_id, e);
                self.update_task_status(TaskStatus::Error, &e.to_string())
                    .await?;
                return Ok(TaskStatus::Error);
            }
        }

        // 依赖安装插件: 失败只告警，不中断执行
        if let Some(installer) = &self.installer {
            if let Err(e) = installer.install(&self.spider, &self.cwd).await {
                warn!("任务 {} 依赖安装失败: {}", self.task_id, e);
            }
        }

        // 拉起子进程
        let mut child = match self.spawn_child().await {
            Ok(child) => child,
            Err(e) => {
                error!("任务 {} 进程启动失败: {}", self.task_id, e);
                self.update_task_status(TaskStatus::Error, &e.to_string())
                    .await?;
                return Ok(TaskStatus::Error);
            }
        };

        let pid = child.id().map(|p| p as i64).unwrap_or(0);
        if pid == 0 {
            self.update_task_status(TaskStatus::Error, "进程启动后无PID")
                .await?;
            return Ok(TaskStatus::Error);
        }
        self.pid.store(pid, Ordering::SeqCst);
        debug!("任务 {} 子进程已启动: pid={}", self.task_id, pid);

        // stdout/stderr读取协程
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        // stdin保持打开（IPC下行管道），清理时随Child一起释放
        let _stdin = child.stdin.take();

        if let Some(stdout) = stdout {
            let runner = self.clone();
            self.track(tokio::spawn(async move {
                runner.read_stdout(stdout).await;
            }));
        }
        if let Some(stderr) = stderr {
            let runner = self.clone();
            self.track(tokio::spawn(async move {
                runner.read_stderr(stderr).await;
            }));
        }

        // 等待子进程退出的专职协程
        {
            let runner = self.clone();
            self.track(tokio::spawn(async move {
                runner.wait_child(child).await;
            }));
        }

        // 监控协程
        self.start_monitors();

        // 等待终态信号
        let signal = {
            let mut rx = self
                .signal_rx
                .lock()
                .await
                .take()
                .ok_or_else(|| CrawlerError::internal("Runner不可重复运行"))?;
            rx.recv().await.unwrap_or(TaskSignal::Error)
        };

        let (status, error_message) = match signal {
            TaskSignal::Finish => (TaskStatus::Finished, String::new()),
            TaskSignal::Cancel => (TaskStatus::Cancelled, String::new()),
            TaskSignal::Error => (TaskStatus::Error, self.exit_error.lock().unwrap().clone()),
            TaskSignal::Lost => {
                // 进程失踪: 兜底清理可能残留的子进程
                let runner = self.clone();
                tokio::spawn(async move {
                    runner.cleanup_orphans().await;
                });
                (TaskStatus::Error, "task process lost".to_string())
            }
        };

        self.update_task_status(status, &error_message).await?;

        match status {
            TaskStatus::Finished => info!("任务完成: {}", self.task_id),
            TaskStatus::Cancelled => info!("任务已取消: {}", self.task_id),
            _ => error!("任务失败: {} - {}", self.task_id, error_message),
        }

        self.shutdown_routines().await;
        Ok(status)
    }

    /// 取消任务
    ///
    /// force=false: 先TERM进程组，宽限期内未退出再KILL；
    /// force=true: 直接KILL进程组。之后在cancel_timeout内轮询进程消失。
    pub async fn cancel(&self, force: bool) -> CrawlerResult<()> {
        info!("取消任务: {} (force={})", self.task_id, force);
        self.cancel_tx.send_replace(true);

        // 先停上行流，避免后台ping与teardown竞争
        *self.uplink.lock().await = None;
        self.uplink_healthy.store(false, Ordering::SeqCst);

        let pid = self.pid();
        if pid <= 0 {
            return Ok(());
        }

        if force {
            process::kill_group(pid, true);
        } else {
            process::kill_group(pid, false);
            let deadline = Instant::now() + self.config.terminate_grace;
            while process::exists(pid) && Instant::now() < deadline {
                tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
            }
            if process::exists(pid) {
                warn!("任务 {} 进程未响应TERM，升级为KILL", self.task_id);
                process::kill_group(pid, true);
            }
        }

        let deadline = Instant::now() + self.config.cancel_timeout;
        while process::exists(pid) {
            if Instant::now() >= deadline {
                return Err(CrawlerError::CancelTimeout {
                    task_id: self.task_id.clone(),
                });
            }
            tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // 内部: 启动
    // ------------------------------------------------------------------

    async fn init_uplink(&self) {
        if self
            .supervisor
            .wait_registered(self.supervisor.client_timeout())
            .await
            .is_err()
        {
            warn!("任务 {} 连接未就绪，暂不建立上行流", self.task_id);
            return;
        }
        match self.open_uplink().await {
            Ok(uplink) => {
                *self.uplink.lock().await = Some(uplink);
                self.uplink_healthy.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                warn!("任务 {} 上行流建立失败: {}", self.task_id, e);
            }
        }
    }

    async fn open_uplink(&self) -> CrawlerResult<UplinkStream> {
        let client = crate::client::TaskClient::new(self.supervisor.clone());
        client.connect().await
    }

    async fn sync_files(&self) -> CrawlerResult<()> {
        let sync_id = if self.spider.git_id.is_empty() {
            self.spider.id.clone()
        } else {
            self.spider.git_id.clone()
        };
        let client =
            FileSyncClient::new(self.config.api_endpoint.clone(), self.config.auth_key.clone());
        client
            .sync_files(&sync_id, &self.spider.git_root_path, &self.cwd)
            .await
    }

    async fn spawn_child(&self) -> CrawlerResult<tokio::process::Child> {
        let task = self.load_task().await?;

        let cmd_str = if task.cmd.is_empty() {
            self.spider.cmd.clone()
        } else {
            task.cmd.clone()
        };
        let param = if task.param.is_empty() {
            self.spider.param.clone()
        } else {
            task.param.clone()
        };
        let full = if param.is_empty() {
            cmd_str
        } else {
            format!("{cmd_str} {param}")
        };

        let argv = split_command(&full);
        if argv.is_empty() {
            return Err(CrawlerError::Spawn(format!("任务命令为空: {}", self.task_id)));
        }

        tokio::fs::create_dir_all(&self.cwd)
            .await
            .map_err(|e| CrawlerError::Spawn(format!("创建工作目录失败: {e}")))?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        self.configure_env(&mut cmd).await;

        // 子进程放进独立进程组，取消时可以整组补刀
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                let _ = nix::unistd::setpgid(
                    nix::unistd::Pid::from_raw(0),
                    nix::unistd::Pid::from_raw(0),
                );
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| CrawlerError::Spawn(format!("启动命令失败 {}: {e}", argv[0])))?;
        Ok(child)
    }

    /// 子进程环境: 宿主环境剔除租户前缀变量，注入工具目录PATH、
    /// 全局环境变量行与任务标记
    async fn configure_env(&self, cmd: &mut Command) {
        cmd.env_clear();
        for (key, value) in std::env::vars() {
            if !key.starts_with(ENV_PREFIX) {
                cmd.env(key, value);
            }
        }

        if !self.config.tool_paths.is_empty() {
            let mut parts: Vec<String> = self
                .config
                .tool_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            if let Ok(current) = std::env::var("PATH") {
                parts.push(current);
            }
            cmd.env("PATH", parts.join(":"));
        }

        match self.store.environments.get_all().await {
            Ok(envs) => {
                for env in envs {
                    cmd.env(env.key, env.value);
                }
            }
            Err(e) => {
                error!("加载全局环境变量失败: {}", e);
            }
        }

        cmd.env(TASK_ID_ENV_KEY, &self.task_id);
        cmd.env(PARENT_PID_ENV_KEY, std::process::id().to_string());
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.handles.lock().unwrap().push(handle);
    }

    fn start_monitors(self: &Arc<Self>) {
        // 进程健康检查: 进程消失发出lost信号
        {
            let runner = self.clone();
            self.track(tokio::spawn(async move {
                runner.process_health_loop().await;
            }));
        }
        // 僵尸进程监控
        {
            let runner = self.clone();
            self.track(tokio::spawn(async move {
                runner.zombie_monitor_loop().await;
            }));
        }
        // 上行流健康检查与重连
        {
            let runner = self.clone();
            self.track(tokio::spawn(async move {
                runner.conn_health_loop().await;
            }));
        }
        // 周期资源巡检
        {
            let runner = self.clone();
            self.track(tokio::spawn(async move {
                runner.periodic_cleanup_loop().await;
            }));
        }
    }

    // ------------------------------------------------------------------
    // 内部: 输出读取
    // ------------------------------------------------------------------

    async fn read_stdout(self: &Arc<Self>, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        let mut cancel_rx = self.cancel_tx.subscribe();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => self.handle_stdout_line(line).await,
                        _ => return,
                    }
                }
                _ = cancel_rx.changed() => {
                    if self.is_cancelled() {
                        return;
                    }
                }
            }
        }
    }

    async fn handle_stdout_line(&self, line: String) {
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if let Some(msg) = parse_ipc_line(&line) {
            if msg.is_data() {
                let records = normalize_payload(msg.payload);
                if records.is_empty() {
                    warn!("任务 {} 的IPC消息没有有效记录", self.task_id);
                    return;
                }
                self.send_frame(ConnectCode::InsertData, serde_json::Value::Array(records))
                    .await;
            } else {
                warn!(
                    "任务 {} 收到未处理的IPC消息类型: {}",
                    self.task_id, msg.msg_type
                );
            }
            return;
        }
        self.send_log_lines(vec![line]).await;
    }

    async fn read_stderr(self: &Arc<Self>, stderr: tokio::process::ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        let mut cancel_rx = self.cancel_tx.subscribe();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            let line = line.trim_end_matches(['\r', '\n']).to_string();
                            self.send_log_lines(vec![line]).await;
                        }
                        _ => return,
                    }
                }
                _ = cancel_rx.changed() => {
                    if self.is_cancelled() {
                        return;
                    }
                }
            }
        }
    }

    async fn send_log_lines(&self, lines: Vec<String>) {
        let data = match serde_json::to_value(&lines) {
            Ok(data) => data,
            Err(e) => {
                error!("日志行序列化失败: {}", e);
                return;
            }
        };
        self.send_frame(ConnectCode::InsertLogs, data).await;
    }

    /// 经上行流发送一帧；无连接时丢弃，发送失败标记为不健康待重连
    async fn send_frame(&self, code: ConnectCode, data: serde_json::Value) {
        if self.is_cancelled() {
            return;
        }
        let mut guard = self.uplink.lock().await;
        let Some(uplink) = guard.as_mut() else {
            debug!("任务 {} 无上行流，丢弃消息", self.task_id);
            return;
        };
        let frame = ConnectFrame {
            task_id: self.task_id.clone(),
            code,
            data,
        };
        if let Err(e) = uplink.send(&frame).await {
            if !self.is_cancelled() {
                error!("任务 {} 上行流发送失败: {}", self.task_id, e);
            }
            self.uplink_healthy.store(false, Ordering::SeqCst);
        }
    }

    // ------------------------------------------------------------------
    // 内部: 进程等待与监控
    // ------------------------------------------------------------------

    async fn wait_child(&self, mut child: tokio::process::Child) {
        let signal = match child.wait().await {
            Ok(status) => {
                if status.success() {
                    debug!("任务 {} 进程正常退出", self.task_id);
                    TaskSignal::Finish
                } else {
                    match status.code() {
                        Some(code) => {
                            *self.exit_error.lock().unwrap() =
                                format!("process exited with code {code}");
                            debug!("任务 {} 进程退出码 {}", self.task_id, code);
                            TaskSignal::Error
                        }
                        // 被信号杀死: 取消路径
                        None => {
                            debug!("任务 {} 进程被信号终止", self.task_id);
                            TaskSignal::Cancel
                        }
                    }
                }
            }
            Err(e) => {
                *self.exit_error.lock().unwrap() = format!("wait failed: {e}");
                TaskSignal::Error
            }
        };
        let _ = self.signal_tx.send(signal).await;
    }

    async fn process_health_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.process_health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut cancel_rx = self.cancel_tx.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pid = self.pid();
                    if pid > 0 && !process::exists(pid) {
                        warn!("任务 {} 进程消失: pid={}", self.task_id, pid);
                        let _ = self.signal_tx.send(TaskSignal::Lost).await;
                        return;
                    }
                }
                _ = cancel_rx.changed() => {
                    if self.is_cancelled() {
                        return;
                    }
                }
            }
        }
    }

    async fn zombie_monitor_loop(self: &Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.zombie_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut cancel_rx = self.cancel_tx.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pid = self.pid();
                    if pid > 0 && process::is_zombie(pid) {
                        warn!("任务 {} 检测到僵尸进程: pid={}", self.task_id, pid);
                        let runner = self.clone();
                        tokio::spawn(async move {
                            runner.cleanup_orphans().await;
                        });
                    }
                }
                _ = cancel_rx.changed() => {
                    if self.is_cancelled() {
                        return;
                    }
                }
            }
        }
    }

    /// 上行流健康检查: 周期发送task_ping，失败后有界退避重连（仅上行流）
    async fn conn_health_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.conn_health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut cancel_rx = self.cancel_tx.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.send_frame(ConnectCode::TaskPing, serde_json::Value::Null).await;
                    if !self.uplink_healthy.load(Ordering::SeqCst) {
                        self.reconnect_uplink().await;
                    }
                }
                _ = cancel_rx.changed() => {
                    if self.is_cancelled() {
                        return;
                    }
                }
            }
        }
    }

    async fn reconnect_uplink(&self) {
        for attempt in 1..=MAX_UPLINK_RECONNECTS {
            if self.is_cancelled() {
                return;
            }
            match self.open_uplink().await {
                Ok(uplink) => {
                    *self.uplink.lock().await = Some(uplink);
                    self.uplink_healthy.store(true, Ordering::SeqCst);
                    info!(
                        "任务 {} 上行流重连成功 (第{}次尝试)",
                        self.task_id, attempt
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "任务 {} 上行流重连失败 ({}/{}): {}",
                        self.task_id, attempt, MAX_UPLINK_RECONNECTS, e
                    );
                    let backoff = std::cmp::min(1u64 << (attempt - 1), 30);
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                }
            }
        }
        error!(
            "任务 {} 上行流重连失败 {} 次，放弃",
            self.task_id, MAX_UPLINK_RECONNECTS
        );
    }

    async fn periodic_cleanup_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut cancel_rx = self.cancel_tx.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!(
                        "任务 {} 巡检: pid={} uplink_healthy={}",
                        self.task_id,
                        self.pid(),
                        self.uplink_healthy.load(Ordering::SeqCst)
                    );
                }
                _ = cancel_rx.changed() => {
                    if self.is_cancelled() {
                        return;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // 内部: 状态写入与清理
    // ------------------------------------------------------------------

    async fn load_task(&self) -> CrawlerResult<Task> {
        self.store
            .tasks
            .get_by_id(&self.task_id)
            .await?
            .ok_or_else(|| CrawlerError::task_not_found(&self.task_id))
    }

    /// 写任务状态并汇总统计
    async fn update_task_status(&self, status: TaskStatus, error: &str) -> CrawlerResult<()> {
        let mut task = self.load_task().await?;
        if task.status.is_terminal() {
            debug!(
                "任务 {} 已处于终态 {}，跳过状态写入 {}",
                self.task_id, task.status, status
            );
            return Ok(());
        }
        task.status = status;
        task.error = error.to_string();
        task.pid = self.pid();
        task.set_updated(SYSTEM_USER);
        self.store.tasks.update(&task).await?;

        // 统计行: 任务入列时创建；缺失时补建兜底
        let mut stat = match self.store.task_stats.get_by_id(&self.task_id).await? {
            Some(stat) => stat,
            None => {
                let stat = crawler_domain::TaskStat::new(self.task_id.clone());
                self.store.task_stats.create(&stat).await?;
                stat
            }
        };

        let now = Utc::now();
        match status {
            TaskStatus::Running => {
                stat.mark_started(now);
                self.store.task_stats.update(&stat).await?;
                self.store
                    .spider_stats
                    .apply_running(&self.spider.id, &self.task_id, stat.wait_duration_ms)
                    .await?;
            }
            s if s.is_terminal() => {
                stat.mark_ended(now);
                self.store.task_stats.update(&stat).await?;
                self.store
                    .spider_stats
                    .apply_terminal(
                        &self.spider.id,
                        &self.task_id,
                        stat.result_count,
                        stat.runtime_duration_ms,
                        stat.total_duration_ms,
                    )
                    .await?;

                // 通知异步发出，不阻塞终态写入
                let notifier = self.notifier.clone();
                tokio::spawn(async move {
                    if let Err(e) = notifier.task_finished(&task).await {
                        error!("任务结束通知失败: {}", e);
                    }
                });
            }
            _ => {}
        }
        Ok(())
    }

    /// 结束所有监控协程并释放上行流
    async fn shutdown_routines(&self) {
        self.cancel_tx.send_replace(true);
        *self.uplink.lock().await = None;

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap());
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(10), join_all)
            .await
            .is_err()
        {
            warn!("任务 {} 的部分协程未在限时内退出", self.task_id);
        }
    }

    /// 孤儿进程清理: 先对进程组补刀，再按环境标记扫描漏网进程
    pub async fn cleanup_orphans(&self) {
        let pid = self.pid();
        warn!("清理任务 {} 的孤儿进程: pid={}", self.task_id, pid);
        if pid > 0 {
            process::kill_group(pid, false);
            tokio::time::sleep(Duration::from_secs(1)).await;
            if process::exists(pid) {
                process::kill_group(pid, true);
            }
        }
        let killed = process::kill_by_task_env(&self.task_id);
        if killed > 0 {
            info!("任务 {} 清理了 {} 个漏网子进程", self.task_id, killed);
        }
    }
}

/// 进程操作（POSIX实现，其余平台退化为空操作）
pub(crate) mod process {
    use tracing::debug;

    /// 进程是否存在
    #[cfg(unix)]
    pub fn exists(pid: i64) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    pub fn exists(_pid: i64) -> bool {
        false
    }

    /// 杀死整个进程组（负PID语义）；进程组操作失败时退回单进程
    #[cfg(unix)]
    pub fn kill_group(pid: i64, force: bool) {
        use nix::sys::signal::{kill, killpg, Signal};
        use nix::unistd::Pid;

        let sig = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        if killpg(Pid::from_raw(pid as i32), sig).is_err() {
            debug!("进程组信号发送失败，退回单进程: pid={}", pid);
            let _ = kill(Pid::from_raw(pid as i32), sig);
        }
    }

    #[cfg(not(unix))]
    pub fn kill_group(_pid: i64, _force: bool) {}

    /// 进程是否处于僵尸状态（/proc stat 状态位 Z）
    #[cfg(target_os = "linux")]
    pub fn is_zombie(pid: i64) -> bool {
        let stat = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat,
            Err(_) => return false,
        };
        // 状态字段在最后一个')'之后
        stat.rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn is_zombie(_pid: i64) -> bool {
        false
    }

    /// 扫描所有进程，杀死环境里带有指定任务标记的进程，返回击杀数
    #[cfg(target_os = "linux")]
    pub fn kill_by_task_env(task_id: &str) -> usize {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let marker = format!("{}={}", crawler_common::TASK_ID_ENV_KEY, task_id);
        let own_pid = std::process::id() as i64;
        let mut killed = 0;

        let entries = match std::fs::read_dir("/proc") {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Ok(pid) = name.to_string_lossy().parse::<i64>() else {
                continue;
            };
            if pid == own_pid {
                continue;
            }
            let environ = match std::fs::read(format!("/proc/{pid}/environ")) {
                Ok(environ) => environ,
                Err(_) => continue,
            };
            let has_marker = environ
                .split(|b| *b == 0)
                .any(|kv| kv == marker.as_bytes());
            if has_marker && kill(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok() {
                killed += 1;
            }
        }
        killed
    }

    #[cfg(not(target_os = "linux"))]
    pub fn kill_by_task_env(_task_id: &str) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawler_config::ConnectionSettings;
    use crawler_domain::{SpiderRunOptions, TaskStat};
    use crawler_infrastructure::{migrate, sqlite_store, NoopNotifier};
    use sqlx::sqlite::SqlitePoolOptions;

    struct Fixture {
        store: Store,
        supervisor: Arc<ConnectionSupervisor>,
        config: RunnerConfig,
        _dir: tempfile::TempDir,
    }

    async fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("t.db").display());
        let pool = SqlitePoolOptions::new().connect(&url).await.unwrap();
        migrate(&pool).await.unwrap();
        let store = sqlite_store(pool);

        // 不可达的主节点: Runner在无上行流的降级模式下执行
        let supervisor = ConnectionSupervisor::new(
            "127.0.0.1:1".to_string(),
            "w1".to_string(),
            "secret".to_string(),
            ConnectionSettings {
                client_timeout_secs: 1,
                connect_timeout_secs: 1,
                ..Default::default()
            },
        );
        let config = RunnerConfig {
            workspace: dir.path().join("workspace"),
            is_master: true, // 跳过文件同步
            cancel_timeout: Duration::from_secs(10),
            terminate_grace: Duration::from_secs(2),
            process_health_interval: Duration::from_millis(200),
            ..Default::default()
        };
        Fixture {
            store,
            supervisor,
            config,
            _dir: dir,
        }
    }

    async fn make_task(store: &Store, cmd: &str) -> Task {
        let spider = Spider::new("demo", cmd);
        store.spiders.create(&spider).await.unwrap();
        let mut task = Task::new(spider.id.clone(), &SpiderRunOptions::default());
        task.cmd = cmd.to_string();
        task.status = TaskStatus::Assigned;
        store.tasks.create(&task).await.unwrap();
        store
            .task_stats
            .create(&TaskStat::new(task.id.clone()))
            .await
            .unwrap();
        task
    }

    #[tokio::test]
    async fn test_run_success_writes_finished() {
        let f = setup().await;
        let task = make_task(&f.store, "echo hi").await;

        let runner = TaskRunner::new(
            &task.id,
            f.store.clone(),
            f.supervisor.clone(),
            Arc::new(NoopNotifier),
            f.config.clone(),
        )
        .await
        .unwrap();

        let status = runner.run().await.unwrap();
        assert_eq!(status, TaskStatus::Finished);

        let loaded = f.store.tasks.get_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Finished);
        assert!(loaded.pid > 0);

        // 统计不变量: total = wait + runtime（毫秒容差内）
        let stat = f.store.task_stats.get_by_id(&task.id).await.unwrap().unwrap();
        assert!(stat.started_at.is_some());
        assert!(stat.ended_at.is_some());
        assert!(
            (stat.total_duration_ms - stat.wait_duration_ms - stat.runtime_duration_ms).abs() <= 1
        );

        // 进程组无残留
        assert!(!process::exists(loaded.pid));
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_writes_error() {
        let f = setup().await;
        let task = make_task(&f.store, "sh -c 'exit 3'").await;

        let runner = TaskRunner::new(
            &task.id,
            f.store.clone(),
            f.supervisor.clone(),
            Arc::new(NoopNotifier),
            f.config.clone(),
        )
        .await
        .unwrap();

        let status = runner.run().await.unwrap();
        assert_eq!(status, TaskStatus::Error);

        let loaded = f.store.tasks.get_by_id(&task.id).await.unwrap().unwrap();
        assert!(loaded.error.contains("code 3"));
    }

    #[tokio::test]
    async fn test_spawn_failure_writes_error() {
        let f = setup().await;
        let task = make_task(&f.store, "/nonexistent/binary-for-test").await;

        let runner = TaskRunner::new(
            &task.id,
            f.store.clone(),
            f.supervisor.clone(),
            Arc::new(NoopNotifier),
            f.config.clone(),
        )
        .await
        .unwrap();

        let status = runner.run().await.unwrap();
        assert_eq!(status, TaskStatus::Error);
        let loaded = f.store.tasks.get_by_id(&task.id).await.unwrap().unwrap();
        assert!(!loaded.error.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_terminates_process_group() {
        let f = setup().await;
        let task = make_task(&f.store, "sleep 300").await;

        let runner = TaskRunner::new(
            &task.id,
            f.store.clone(),
            f.supervisor.clone(),
            Arc::new(NoopNotifier),
            f.config.clone(),
        )
        .await
        .unwrap();

        let run_handle = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run().await })
        };

        // 等子进程起来
        let mut waited = 0;
        while runner.pid() == 0 && waited < 100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += 1;
        }
        let pid = runner.pid();
        assert!(pid > 0, "子进程应已启动");

        runner.cancel(false).await.unwrap();

        let status = run_handle.await.unwrap().unwrap();
        assert_eq!(status, TaskStatus::Cancelled);
        let loaded = f.store.tasks.get_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
        assert!(!process::exists(pid), "取消后不得残留子进程");
    }

    #[tokio::test]
    async fn test_installer_hook_runs_before_spawn() {
        struct RecordingInstaller {
            called: std::sync::Mutex<Vec<String>>,
        }

        #[async_trait::async_trait]
        impl DependencyInstaller for RecordingInstaller {
            async fn install(
                &self,
                spider: &Spider,
                _cwd: &std::path::Path,
            ) -> crawler_errors::CrawlerResult<()> {
                self.called.lock().unwrap().push(spider.id.clone());
                Ok(())
            }
        }

        let f = setup().await;
        let task = make_task(&f.store, "echo hi").await;
        let installer = Arc::new(RecordingInstaller {
            called: std::sync::Mutex::new(Vec::new()),
        });

        let runner = TaskRunner::new(
            &task.id,
            f.store.clone(),
            f.supervisor.clone(),
            Arc::new(NoopNotifier),
            f.config.clone(),
        )
        .await
        .unwrap()
        .with_installer(installer.clone());

        let status = runner.run().await.unwrap();
        assert_eq!(status, TaskStatus::Finished);
        assert_eq!(installer.called.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_child_env_contains_task_marker() {
        let f = setup().await;
        // 子进程把任务标记环境变量回显到文件
        let out_file = f._dir.path().join("env_out.txt");
        let cmd = format!("sh -c 'echo -n $CRAWLER_TASK_ID > {}'", out_file.display());
        let task = make_task(&f.store, &cmd).await;

        let runner = TaskRunner::new(
            &task.id,
            f.store.clone(),
            f.supervisor.clone(),
            Arc::new(NoopNotifier),
            f.config.clone(),
        )
        .await
        .unwrap();
        let status = runner.run().await.unwrap();
        assert_eq!(status, TaskStatus::Finished);

        let content = std::fs::read_to_string(&out_file).unwrap();
        assert_eq!(content, task.id);
    }
}
