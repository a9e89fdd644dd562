//! # 帧编解码
//!
//! 4字节大端长度前缀 + JSON文档。读到流结束返回 `None`，超限帧直接报错，
//! 避免异常对端拖垮内存。

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crawler_errors::{CrawlerError, CrawlerResult};

/// 单帧上限
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// 写出一帧
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> CrawlerResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(CrawlerError::invalid_input(format!(
            "帧大小超限: {} > {MAX_FRAME_SIZE}",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// 读入一帧
///
/// 对端正常关闭连接时返回 `Ok(None)`；帧中途断开视为网络错误。
pub async fn read_frame<R, T>(reader: &mut R) -> CrawlerResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CrawlerError::network(e.to_string())),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CrawlerError::invalid_input(format!(
            "帧大小超限: {len} > {MAX_FRAME_SIZE}"
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| CrawlerError::network(e.to_string()))?;

    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{ConnectCode, ConnectFrame, Hello, RpcVerb};

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let hello = Hello {
            verb: RpcVerb::FetchTask,
            node_key: "w1".to_string(),
            auth_token: "secret".to_string(),
            payload: serde_json::json!({"node_key": "w1"}),
        };
        write_frame(&mut client, &hello).await.unwrap();

        let received: Hello = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(received.verb, RpcVerb::FetchTask);
        assert_eq!(received.node_key, "w1");
        assert_eq!(received.payload["node_key"], "w1");
    }

    #[tokio::test]
    async fn test_frame_ordering_preserved() {
        // 同一连接内帧按发送顺序到达
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        for i in 0..10 {
            let frame = ConnectFrame {
                task_id: "t".to_string(),
                code: ConnectCode::InsertLogs,
                data: serde_json::json!([format!("line-{i}")]),
            };
            write_frame(&mut client, &frame).await.unwrap();
        }
        drop(client);

        let mut count = 0;
        while let Some(frame) = read_frame::<_, ConnectFrame>(&mut server).await.unwrap() {
            assert_eq!(frame.data[0], format!("line-{count}"));
            count += 1;
        }
        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        let result: Option<Hello> = read_frame(&mut server).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            // 手工写入一个声明超限长度的帧头
            let _ = client
                .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
                .await;
        });
        let result: CrawlerResult<Option<Hello>> = read_frame(&mut server).await;
        assert!(result.is_err());
    }
}
