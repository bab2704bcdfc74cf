//! Endpoint server for exposing metrics and coordinator status

use crate::metrics::metrics;
use crate::transaction::TransactionCoordinator;
use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Start the endpoint server
///
/// `GET /metrics` answers prometheus text, `GET /status` the coordinator
/// stats as JSON.
pub async fn endpoint_server(port: u16, coordinator: Arc<TransactionCoordinator>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Metrics endpoint listening on {}", addr);
    serve(listener, coordinator).await
}

/// Accept loop on an already bound listener
pub async fn serve(listener: TcpListener, coordinator: Arc<TransactionCoordinator>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, &coordinator).await {
                        tracing::debug!(peer = %peer, error = %e, "Endpoint connection failed");
                    }
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_connection(mut socket: TcpStream, coordinator: &TransactionCoordinator) -> Result<()> {
    let mut buf = [0; 1024];
    let read = socket.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..read]);

    let response = respond(request_path(&request), coordinator);
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await?;
    Ok(())
}

/// Path of a `GET` request line, if any
fn request_path(request: &str) -> Option<&str> {
    let mut parts = request.lines().next()?.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(path)) => Some(path.split('?').next().unwrap_or(path)),
        _ => None,
    }
}

fn respond(path: Option<&str>, coordinator: &TransactionCoordinator) -> String {
    match path {
        Some("/metrics") => match metrics().encode() {
            Ok(body) => http_response("200 OK", "text/plain; version=0.0.4", &body),
            Err(e) => http_response("500 Internal Server Error", "text/plain", &e.to_string()),
        },
        Some("/status") => match serde_json::to_string_pretty(&coordinator.stats()) {
            Ok(body) => http_response("200 OK", "application/json", &body),
            Err(e) => http_response("500 Internal Server Error", "text/plain", &e.to_string()),
        },
        Some(_) => http_response("404 Not Found", "text/plain", "not found"),
        None => http_response("405 Method Not Allowed", "text/plain", "only GET is supported"),
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}
