use crate::admin::Admin;
use crate::fleet::Fleet;
use crate::model::HeartbeatRecord;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Accepts heartbeat connections: one task per instance connection,
/// newline-delimited JSON records. A record that fails to decode is
/// dropped; a socket error unregisters the client.
pub async fn heartbeat_listener(
    listener: TcpListener,
    fleet: Arc<Fleet>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_heartbeats(stream, peer, fleet.clone()));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "heartbeat accept failed");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }
}

async fn serve_heartbeats(stream: TcpStream, peer: SocketAddr, fleet: Arc<Fleet>) {
    tracing::debug!(%peer, "heartbeat client connected");
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<HeartbeatRecord>(line) {
                    Ok(hb) => fleet.upsert_heartbeat(hb),
                    Err(err) => {
                        // One bad record never takes the connection down.
                        tracing::warn!(%peer, error = %err, "dropping undecodable heartbeat");
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(%peer, "heartbeat client disconnected");
                return;
            }
            Err(err) => {
                tracing::warn!(%peer, error = %err, "heartbeat socket error; unregistering client");
                return;
            }
        }
    }
}

/// Line-oriented operator console, meant for localhost only.
pub async fn admin_listener(
    listener: TcpListener,
    admin: Arc<Admin>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_admin(stream, peer, admin.clone()));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "admin accept failed");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }
}

async fn serve_admin(stream: TcpStream, peer: SocketAddr, admin: Arc<Admin>) {
    tracing::info!(%peer, "admin client connected");
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        tracing::info!(%peer, command = line, "admin command");
        let mut response = admin.handle(line).await;
        response.push('\n');
        if write.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::tests_support::RecordingNotifier;
    use crate::model::Region;

    fn shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn heartbeats_feed_the_fleet_and_bad_lines_are_dropped() {
        let fleet = Arc::new(Fleet::new(
            Arc::new(RecordingNotifier::default()),
            Duration::from_secs(30),
            Duration::from_secs(60),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(heartbeat_listener(listener, fleet.clone(), shutdown()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"this is not json\n").await.unwrap();
        client
            .write_all(
                br#"{"instanceId":"i-1","instanceType":"c5n.large","tenantId":7,"credentialId":"2","ipv4":"9.9.9.9","region":"HK","launchedAt":1700000000,"reportedAt":1700000042}"#,
            )
            .await
            .unwrap();
        client.write_all(b"\n").await.unwrap();
        client.flush().await.unwrap();

        for _ in 0..100 {
            if fleet.get("i-1").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let instance = fleet.get("i-1").expect("heartbeat not ingested");
        assert_eq!(instance.tenant_id, 7);
        assert_eq!(instance.region, Region::Hk);
        assert_eq!(fleet.list_all().len(), 1);
    }
}
