//! # RPC客户端stub
//!
//! 每次调用打开一条到主节点的连接: 一元动词收到应答即完成，
//! 流式动词在确认帧之后保持连接收发。

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::debug;

use crawler_errors::{CrawlerError, CrawlerResult};
use crawler_protocol::{
    read_frame, write_frame, ConnectFrame, FetchTaskRequest, FetchTaskResponse, HeartbeatRequest,
    Hello, NodeSubscribeFrame, NodeSubscribeRequest, RegisterNodeRequest, Reply, RpcVerb,
    SubscribeFrame, TaskSubscribeRequest,
};

use crate::connection::ConnectionSupervisor;

/// 节点服务stub
pub struct NodeClient {
    sup: Arc<ConnectionSupervisor>,
}

impl NodeClient {
    pub(crate) fn new(sup: Arc<ConnectionSupervisor>) -> Self {
        Self { sup }
    }

    /// 注册节点（幂等），返回节点ID
    pub async fn register(&self, req: &RegisterNodeRequest) -> CrawlerResult<String> {
        let payload = self
            .sup
            .call(RpcVerb::RegisterNode, serde_json::to_value(req)?)
            .await?;
        payload["node_id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| CrawlerError::internal("注册应答缺少node_id"))
    }

    pub async fn send_heartbeat(&self, node_key: &str) -> CrawlerResult<()> {
        self.sup
            .call(
                RpcVerb::SendHeartbeat,
                serde_json::to_value(HeartbeatRequest {
                    node_key: node_key.to_string(),
                })?,
            )
            .await?;
        Ok(())
    }

    /// 打开节点管理流
    pub async fn subscribe(&self, node_key: &str) -> CrawlerResult<NodeSubscribeStream> {
        let stream = self
            .sup
            .open_stream(
                RpcVerb::NodeSubscribe,
                serde_json::to_value(NodeSubscribeRequest {
                    node_key: node_key.to_string(),
                })?,
            )
            .await?;
        Ok(NodeSubscribeStream { stream })
    }
}

/// 任务服务stub
pub struct TaskClient {
    sup: Arc<ConnectionSupervisor>,
}

impl std::fmt::Debug for TaskClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskClient").finish_non_exhaustive()
    }
}

impl TaskClient {
    pub(crate) fn new(sup: Arc<ConnectionSupervisor>) -> Self {
        Self { sup }
    }

    /// 领取一个待执行任务，返回空字符串表示无任务
    pub async fn fetch_task(&self, node_key: &str) -> CrawlerResult<String> {
        let payload = self
            .sup
            .call(
                RpcVerb::FetchTask,
                serde_json::to_value(FetchTaskRequest {
                    node_key: node_key.to_string(),
                })?,
            )
            .await?;
        let resp: FetchTaskResponse = serde_json::from_value(payload)?;
        Ok(resp.task_id)
    }

    /// 打开任务上行流
    pub async fn connect(&self) -> CrawlerResult<UplinkStream> {
        let stream = self
            .sup
            .open_stream(RpcVerb::TaskConnect, serde_json::Value::Null)
            .await?;
        Ok(UplinkStream { stream })
    }

    /// 打开任务下行流
    pub async fn subscribe(&self, task_id: &str) -> CrawlerResult<DownlinkStream> {
        let stream = self
            .sup
            .open_stream(
                RpcVerb::TaskSubscribe,
                serde_json::to_value(TaskSubscribeRequest {
                    task_id: task_id.to_string(),
                })?,
            )
            .await?;
        Ok(DownlinkStream { stream })
    }
}

/// 任务上行流（从→主）
pub struct UplinkStream {
    stream: TcpStream,
}

impl UplinkStream {
    pub async fn send(&mut self, frame: &ConnectFrame) -> CrawlerResult<()> {
        write_frame(&mut self.stream, frame).await
    }
}

/// 任务下行流（主→从）
pub struct DownlinkStream {
    stream: TcpStream,
}

impl DownlinkStream {
    /// 接收下一帧，流关闭时返回None
    pub async fn recv(&mut self) -> CrawlerResult<Option<SubscribeFrame>> {
        read_frame(&mut self.stream).await
    }
}

/// 节点管理流（主→从）
pub struct NodeSubscribeStream {
    stream: TcpStream,
}

impl NodeSubscribeStream {
    pub async fn recv(&mut self) -> CrawlerResult<Option<NodeSubscribeFrame>> {
        read_frame(&mut self.stream).await
    }
}

/// 独立于连接管理器的一次性调用（注册重试等场景不依赖stub就绪状态）
pub async fn raw_call(
    address: &str,
    node_key: &str,
    auth_key: &str,
    verb: RpcVerb,
    payload: serde_json::Value,
) -> CrawlerResult<serde_json::Value> {
    let mut stream = TcpStream::connect(address)
        .await
        .map_err(|e| CrawlerError::network(format!("连接主节点失败: {e}")))?;
    write_frame(
        &mut stream,
        &Hello {
            verb,
            node_key: node_key.to_string(),
            auth_token: auth_key.to_string(),
            payload,
        },
    )
    .await?;
    let reply: Reply = read_frame(&mut stream)
        .await?
        .ok_or_else(|| CrawlerError::network("连接在应答前被关闭"))?;
    debug!("一次性调用完成: {:?}", verb);
    reply.into_result()
}
