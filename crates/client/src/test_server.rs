use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Key/value pairs a fake route saw, in arrival order.
pub(crate) type Recorded = Arc<Mutex<Vec<(String, String)>>>;

pub(crate) fn recorded_values(recorded: &Recorded) -> Vec<(String, String)> {
    recorded.lock().expect("recorded lock").clone()
}

/// Local HTTP server bound to an ephemeral port, stopped on drop.
pub(crate) struct TestServer {
    pub(crate) base_url: String,
    task: JoinHandle<()>,
}

impl TestServer {
    pub(crate) async fn spawn(app: Router) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server listener");
        let address: SocketAddr = listener.local_addr().expect("test server local addr");
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("run test server");
        });
        Self {
            base_url: format!("http://{address}"),
            task,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
