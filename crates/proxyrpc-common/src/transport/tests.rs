//! Integration tests for the transport layer
//!
//! These tests run the TCP connection against an in-process frame server.

#[cfg(test)]
mod tests {
    use crate::protocol::{ErrorCode, Method, RpcError, RpcRequest, RpcResponse, ServerError};
    use crate::transport::{read_frame, write_frame, Connection, Dialer, FrameCodec, TcpDialer};
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Serves exchanges until the peer goes away. Requests for `RemoveNode` get an error,
    /// `GetNode` echoes the body back with the attachments.
    async fn spawn_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    while let Ok(data) = read_frame(&mut stream).await {
                        let request = FrameCodec::decode_request(&data).unwrap();
                        let response = match request.method {
                            Method::RemoveNode => RpcResponse::error(
                                request.request_id,
                                ServerError::new(ErrorCode::AuthorizationError, "denied"),
                            ),
                            Method::ListNode => {
                                // Never answer
                                tokio::time::sleep(Duration::from_secs(3600)).await;
                                continue;
                            }
                            _ => RpcResponse::success(request.request_id, request.body.clone())
                                .with_attachments(request.attachments.clone()),
                        };
                        let frame = FrameCodec::encode_response(&response).unwrap();
                        if write_frame(&mut stream, &frame).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_round_trip_with_attachments() {
        let addr = spawn_server().await;
        let conn = TcpDialer::new().dial(&addr).await.unwrap();
        assert_eq!(conn.address(), addr);

        let request = RpcRequest::new(Method::GetNode, json!({"path": "//home"}))
            .with_attachments(vec![Bytes::from_static(b"rows")]);
        let response = conn.send(request).await.unwrap();

        assert_eq!(response.body, json!({"path": "//home"}));
        assert_eq!(response.attachments, vec![Bytes::from_static(b"rows")]);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_connection_is_reused_sequentially() {
        let addr = spawn_server().await;
        let conn = TcpDialer::new().dial(&addr).await.unwrap();

        for i in 0..10 {
            let response = conn
                .send(RpcRequest::new(Method::GetNode, json!({"i": i})))
                .await
                .unwrap();
            assert_eq!(response.body, json!({"i": i}));
        }
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_serialized() {
        let addr = spawn_server().await;
        let conn = TcpDialer::new().dial(&addr).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    conn.send(RpcRequest::new(Method::GetNode, json!({"i": i})))
                        .await
                        .map(|r| r.body)
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), json!({"i": i}));
        }
    }

    #[tokio::test]
    async fn test_server_error_is_carried_in_response() {
        let addr = spawn_server().await;
        let conn = TcpDialer::new().dial(&addr).await.unwrap();

        let response = conn
            .send(RpcRequest::new(Method::RemoveNode, json!({})))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, ErrorCode::AuthorizationError);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_abandoned_exchange_breaks_connection() {
        let addr = spawn_server().await;
        let conn = TcpDialer::new().dial(&addr).await.unwrap();

        let pending = conn.send(RpcRequest::new(Method::ListNode, json!({})));
        let result = tokio::time::timeout(Duration::from_millis(50), pending).await;
        assert!(result.is_err());

        assert!(conn.is_closed());
        let err = conn
            .send(RpcRequest::new(Method::GetNode, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let addr = spawn_server().await;
        let conn = TcpDialer::new().dial(&addr).await.unwrap();

        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        assert!(conn
            .send(RpcRequest::new(Method::GetNode, json!({})))
            .await
            .is_err());
    }
}
