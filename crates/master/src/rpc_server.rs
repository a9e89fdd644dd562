//! # 主节点RPC服务
//!
//! 监听TCP端口，为每个连接spawn一个处理任务。连接首帧携带动词与共享
//! 密钥，认证失败立即应答并关闭。一元动词应答后关闭；流式动词保持
//! 连接直到对端关闭、出错或到达上限。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crawler_domain::{Node, Store};
use crawler_errors::{CrawlerError, CrawlerResult};
use crawler_protocol::{
    read_frame, write_frame, ConnectCode, ConnectFrame, FetchTaskRequest, FetchTaskResponse,
    HeartbeatRequest, Hello, NodeSubscribeCode, NodeSubscribeFrame, RegisterNodeRequest, Reply,
    RpcVerb, TaskSubscribeRequest,
};

use crate::registry::SubscriptionRegistry;
use crate::stats::TaskStatsService;

/// 节点管理流的保活间隔
const NODE_PING_INTERVAL: Duration = Duration::from_secs(30);

pub struct RpcServer {
    auth_key: String,
    store: Store,
    stats: Arc<TaskStatsService>,
    subscriptions: Arc<SubscriptionRegistry>,
    /// 单个任务下行流的最长保持时间
    stream_max_age: Duration,
}

impl RpcServer {
    pub fn new(
        auth_key: String,
        store: Store,
        stats: Arc<TaskStatsService>,
        subscriptions: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            auth_key,
            store,
            stats,
            subscriptions,
            stream_max_age: Duration::from_secs(24 * 3600),
        }
    }

    pub fn with_stream_max_age(mut self, max_age: Duration) -> Self {
        self.stream_max_age = max_age;
        self
    }

    /// 绑定监听端口（端口0时由系统分配，返回实际地址）
    pub async fn bind(addr: &str) -> CrawlerResult<TcpListener> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CrawlerError::network(format!("RPC服务绑定失败 {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| CrawlerError::network(e.to_string()))?;
        info!("RPC服务监听: {}", local);
        Ok(listener)
    }

    /// 接入循环
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("接入连接: {}", peer);
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    debug!("连接处理结束: {} - {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("接受连接失败: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("RPC服务停止接入");
                    return;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> CrawlerResult<()> {
        let (mut reader, mut writer) = stream.into_split();

        let hello: Hello = match read_frame(&mut reader).await? {
            Some(hello) => hello,
            None => return Ok(()),
        };

        // 认证: 共享密钥不匹配直接拒绝
        if hello.auth_token != self.auth_key {
            warn!("认证失败的连接请求: node_key={}", hello.node_key);
            write_frame(&mut writer, &Reply::err(&CrawlerError::Unauthorized)).await?;
            return Ok(());
        }

        match hello.verb {
            RpcVerb::Ping => {
                write_frame(&mut writer, &Reply::ok(serde_json::Value::Null)).await
            }
            RpcVerb::RegisterNode => {
                let reply = self.handle_register(hello.payload).await;
                write_frame(&mut writer, &reply).await
            }
            RpcVerb::SendHeartbeat => {
                let reply = self.handle_heartbeat(hello.payload).await;
                write_frame(&mut writer, &reply).await
            }
            RpcVerb::FetchTask => {
                let reply = self.handle_fetch_task(hello.payload).await;
                write_frame(&mut writer, &reply).await
            }
            RpcVerb::TaskConnect => self.handle_task_connect(reader, writer).await,
            RpcVerb::TaskSubscribe => {
                self.handle_task_subscribe(hello.payload, reader, writer).await
            }
            RpcVerb::NodeSubscribe => self.handle_node_subscribe(reader, writer).await,
        }
    }

    async fn handle_register(&self, payload: serde_json::Value) -> Reply {
        let req: RegisterNodeRequest = match serde_json::from_value(payload) {
            Ok(req) => req,
            Err(e) => return Reply::err(&CrawlerError::invalid_input(e.to_string())),
        };
        if req.node_key.is_empty() {
            return Reply::err(&CrawlerError::invalid_input("node_key不能为空"));
        }

        let node = Node::new(&req.node_key, &req.node_name, req.is_master, req.max_runners);
        match self.store.nodes.upsert(&node).await {
            Ok(node) => {
                info!("节点注册成功: {} id={}", node.key, node.id);
                Reply::ok(serde_json::json!({"node_id": node.id}))
            }
            Err(e) => {
                error!("节点注册失败: {} - {}", req.node_key, e);
                Reply::err(&e)
            }
        }
    }

    async fn handle_heartbeat(&self, payload: serde_json::Value) -> Reply {
        let req: HeartbeatRequest = match serde_json::from_value(payload) {
            Ok(req) => req,
            Err(e) => return Reply::err(&CrawlerError::invalid_input(e.to_string())),
        };
        match self.store.nodes.update_heartbeat(&req.node_key, Utc::now()).await {
            Ok(()) => Reply::ok(serde_json::Value::Null),
            Err(e) => Reply::err(&e),
        }
    }

    async fn handle_fetch_task(&self, payload: serde_json::Value) -> Reply {
        let req: FetchTaskRequest = match serde_json::from_value(payload) {
            Ok(req) => req,
            Err(e) => return Reply::err(&CrawlerError::invalid_input(e.to_string())),
        };

        let node = match self.store.nodes.get_by_key(&req.node_key).await {
            Ok(Some(node)) => node,
            Ok(None) => return Reply::err(&CrawlerError::node_not_found(&req.node_key)),
            Err(e) => return Reply::err(&e),
        };

        match self.store.tasks.claim_pending_task(&node.id).await {
            Ok(Some(task)) => {
                debug!("任务 {} 指派给节点 {}", task.id, node.key);
                Reply::ok(
                    serde_json::to_value(FetchTaskResponse { task_id: task.id })
                        .unwrap_or(serde_json::Value::Null),
                )
            }
            Ok(None) => Reply::ok(
                serde_json::to_value(FetchTaskResponse {
                    task_id: String::new(),
                })
                .unwrap_or(serde_json::Value::Null),
            ),
            Err(e) => {
                error!("领取任务失败: {} - {}", node.key, e);
                Reply::err(&e)
            }
        }
    }

    /// 任务上行流: 持续接收记录/日志帧直到对端关闭
    async fn handle_task_connect(
        &self,
        mut reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
    ) -> CrawlerResult<()> {
        write_frame(&mut writer, &Reply::ok(serde_json::Value::Null)).await?;
        debug!("任务上行流已建立");

        loop {
            let frame: Option<ConnectFrame> = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    // 解码失败等接收错误: 记录并终止流
                    error!("上行流接收错误: {}", e);
                    return Err(e);
                }
            };
            let frame = match frame {
                Some(frame) => frame,
                None => {
                    debug!("任务上行流正常关闭");
                    return Ok(());
                }
            };

            if frame.task_id.is_empty() {
                warn!("上行流消息缺少任务ID，忽略");
                continue;
            }

            match frame.code {
                ConnectCode::InsertData => {
                    self.stats.handle_insert_data(&frame.task_id, frame.data).await;
                }
                ConnectCode::InsertLogs => {
                    self.stats.handle_insert_logs(&frame.task_id, frame.data).await;
                }
                ConnectCode::TaskPing => {
                    // 健康探测，无副作用
                }
                ConnectCode::Unknown => {
                    // 向前兼容: 未知消息码记录后忽略
                    warn!("任务 {} 上行流收到未知消息码，已忽略", frame.task_id);
                }
            }
        }
    }

    /// 任务下行流: 登记到订阅注册表，把取消帧透传给对端
    async fn handle_task_subscribe(
        &self,
        payload: serde_json::Value,
        mut reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
    ) -> CrawlerResult<()> {
        let req: TaskSubscribeRequest = match serde_json::from_value(payload) {
            Ok(req) => req,
            Err(e) => {
                let err = CrawlerError::invalid_input(e.to_string());
                write_frame(&mut writer, &Reply::err(&err)).await?;
                return Err(err);
            }
        };
        if req.task_id.is_empty() {
            let err = CrawlerError::invalid_input("task_id不能为空");
            write_frame(&mut writer, &Reply::err(&err)).await?;
            return Err(err);
        }

        let (tx, mut rx) = mpsc::channel(16);
        let token = self.subscriptions.add(&req.task_id, tx);
        info!("任务下行流已建立: {}", req.task_id);

        write_frame(&mut writer, &Reply::ok(serde_json::Value::Null)).await?;

        // 到达上限的流强制关闭，防止永久泄漏
        let deadline = tokio::time::sleep(self.stream_max_age);
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = write_frame(&mut writer, &frame).await {
                                error!("任务 {} 下行流发送失败: {}", req.task_id, e);
                                break Err(e);
                            }
                        }
                        None => break Ok(()),
                    }
                }
                // 对端关闭或读错误都结束本流
                read = read_frame::<_, serde_json::Value>(&mut reader) => {
                    match read {
                        Ok(None) => {
                            debug!("任务 {} 下行流对端关闭", req.task_id);
                            break Ok(());
                        }
                        Ok(Some(_)) => {
                            // 下行流不接受上行数据，忽略
                            continue;
                        }
                        Err(e) => break Err(e),
                    }
                }
                _ = &mut deadline => {
                    warn!("任务 {} 下行流达到保持上限，强制关闭", req.task_id);
                    break Ok(());
                }
            }
        };

        self.subscriptions.remove(&req.task_id, token);
        info!("任务下行流已关闭: {}", req.task_id);
        result
    }

    /// 节点管理流: 周期发送保活ping
    async fn handle_node_subscribe(
        &self,
        mut reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
    ) -> CrawlerResult<()> {
        write_frame(&mut writer, &Reply::ok(serde_json::Value::Null)).await?;

        let mut ticker = tokio::time::interval(NODE_PING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let frame = NodeSubscribeFrame { code: NodeSubscribeCode::ConnectPing };
                    if write_frame(&mut writer, &frame).await.is_err() {
                        debug!("节点管理流对端失联");
                        return Ok(());
                    }
                }
                read = read_frame::<_, serde_json::Value>(&mut reader) => {
                    match read {
                        Ok(None) | Err(_) => {
                            debug!("节点管理流关闭");
                            return Ok(());
                        }
                        Ok(Some(_)) => continue,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawler_domain::{Spider, SpiderRunOptions, Task, TaskStat, TaskStatus};
    use crawler_infrastructure::{migrate, sqlite_store, FileLogStorage, SqliteRecordSink};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn start_server() -> (Arc<RpcServer>, Store, String, broadcast::Sender<()>, tempfile::TempDir)
    {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("t.db").display());
        let pool = SqlitePoolOptions::new().connect(&url).await.unwrap();
        migrate(&pool).await.unwrap();
        let store = sqlite_store(pool.clone());

        let stats = Arc::new(TaskStatsService::new(
            store.clone(),
            Arc::new(FileLogStorage::new(dir.path().join("logs"))),
            Arc::new(SqliteRecordSink::new(pool)),
        ));
        let server = Arc::new(RpcServer::new(
            "secret".to_string(),
            store.clone(),
            stats,
            Arc::new(SubscriptionRegistry::new()),
        ));

        let listener = RpcServer::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(server.clone().serve(listener, shutdown_tx.subscribe()));
        (server, store, addr, shutdown_tx, dir)
    }

    async fn call(addr: &str, hello: &Hello) -> Reply {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, hello).await.unwrap();
        read_frame(&mut stream).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_unauthorized_rejected() {
        let (_server, _store, addr, _shutdown, _dir) = start_server().await;

        let reply = call(
            &addr,
            &Hello {
                verb: RpcVerb::Ping,
                node_key: "w1".to_string(),
                auth_token: "wrong".to_string(),
                payload: serde_json::Value::Null,
            },
        )
        .await;
        assert!(!reply.ok);
        assert_eq!(reply.error_kind, "unauthorized");
    }

    #[tokio::test]
    async fn test_register_and_fetch_task() {
        let (_server, store, addr, _shutdown, _dir) = start_server().await;

        let reply = call(
            &addr,
            &Hello {
                verb: RpcVerb::RegisterNode,
                node_key: "w1".to_string(),
                auth_token: "secret".to_string(),
                payload: serde_json::json!({
                    "node_key": "w1", "node_name": "worker-1", "max_runners": 2
                }),
            },
        )
        .await;
        assert!(reply.ok);
        let node = store.nodes.get_by_key("w1").await.unwrap().unwrap();

        // 队列为空: 返回空任务ID
        let reply = call(
            &addr,
            &Hello {
                verb: RpcVerb::FetchTask,
                node_key: "w1".to_string(),
                auth_token: "secret".to_string(),
                payload: serde_json::json!({"node_key": "w1"}),
            },
        )
        .await;
        assert!(reply.ok);
        assert_eq!(reply.payload["task_id"], "");

        // 入列一个任务后可以领到
        let spider = Spider::new("demo", "echo hi");
        store.spiders.create(&spider).await.unwrap();
        let task = Task::new(spider.id.clone(), &SpiderRunOptions::default());
        store.tasks.create(&task).await.unwrap();

        let reply = call(
            &addr,
            &Hello {
                verb: RpcVerb::FetchTask,
                node_key: "w1".to_string(),
                auth_token: "secret".to_string(),
                payload: serde_json::json!({"node_key": "w1"}),
            },
        )
        .await;
        assert_eq!(reply.payload["task_id"], task.id);

        let claimed = store.tasks.get_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Assigned);
        assert_eq!(claimed.node_id, node.id);
    }

    #[tokio::test]
    async fn test_connect_stream_ingests_logs_and_data() {
        let (_server, store, addr, _shutdown, _dir) = start_server().await;

        let spider = Spider::new("demo", "echo hi");
        store.spiders.create(&spider).await.unwrap();
        let task = Task::new(spider.id.clone(), &SpiderRunOptions::default());
        store.tasks.create(&task).await.unwrap();
        store
            .task_stats
            .create(&TaskStat::new(task.id.clone()))
            .await
            .unwrap();

        let mut stream = TcpStream::connect(&addr).await.unwrap();
        write_frame(
            &mut stream,
            &Hello {
                verb: RpcVerb::TaskConnect,
                node_key: "w1".to_string(),
                auth_token: "secret".to_string(),
                payload: serde_json::Value::Null,
            },
        )
        .await
        .unwrap();
        let reply: Reply = read_frame(&mut stream).await.unwrap().unwrap();
        assert!(reply.ok);

        write_frame(
            &mut stream,
            &ConnectFrame {
                task_id: task.id.clone(),
                code: ConnectCode::InsertLogs,
                data: serde_json::json!(["hello", "world"]),
            },
        )
        .await
        .unwrap();
        write_frame(
            &mut stream,
            &ConnectFrame {
                task_id: task.id.clone(),
                code: ConnectCode::InsertData,
                data: serde_json::json!([{"title": "a"}]),
            },
        )
        .await
        .unwrap();
        // 未知消息码被忽略，不中断流
        write_frame(
            &mut stream,
            &ConnectFrame {
                task_id: task.id.clone(),
                code: ConnectCode::Unknown,
                data: serde_json::Value::Null,
            },
        )
        .await
        .unwrap();
        write_frame(
            &mut stream,
            &ConnectFrame {
                task_id: task.id.clone(),
                code: ConnectCode::TaskPing,
                data: serde_json::Value::Null,
            },
        )
        .await
        .unwrap();
        drop(stream);

        // 等服务端消化完
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stat = store.task_stats.get_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(stat.result_count, 1);
    }

    #[tokio::test]
    async fn test_subscribe_stream_delivers_cancel() {
        let (server, _store, addr, _shutdown, _dir) = start_server().await;

        let mut stream = TcpStream::connect(&addr).await.unwrap();
        write_frame(
            &mut stream,
            &Hello {
                verb: RpcVerb::TaskSubscribe,
                node_key: "w1".to_string(),
                auth_token: "secret".to_string(),
                payload: serde_json::json!({"task_id": "task-1"}),
            },
        )
        .await
        .unwrap();
        let reply: Reply = read_frame(&mut stream).await.unwrap().unwrap();
        assert!(reply.ok);

        // 等注册表登记
        tokio::time::sleep(Duration::from_millis(50)).await;
        let sender = server.subscriptions.get("task-1").expect("下行流应已登记");
        sender
            .send(crawler_protocol::SubscribeFrame {
                code: crawler_protocol::SubscribeCode::Cancel,
                task_id: "task-1".to_string(),
                force: true,
            })
            .await
            .unwrap();

        let frame: crawler_protocol::SubscribeFrame =
            read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(frame.code, crawler_protocol::SubscribeCode::Cancel);
        assert!(frame.force);

        // 对端关闭后注册表条目被摘除
        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.subscriptions.get("task-1").is_none());
    }
}
