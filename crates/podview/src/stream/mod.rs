//! Stream transport
//!
//! Fetches live camera feeds over HTTP, splits `multipart/x-mixed-replace`
//! bodies into JPEG frames, buffers them in a delayed frame cache, and talks
//! to the relay server's monitoring endpoints (warmup and relay status).

pub mod backend;
pub mod cache;
pub mod mjpeg;
pub mod surface;

pub use backend::{BackendClient, RelayInfo, RelayStatus};
pub use cache::{CacheConfig, CacheStatus, FrameCache, SharedCache};
pub use mjpeg::{jpeg_dimensions, Frame, MultipartParser};
pub use surface::{HttpSurface, SurfaceEvent, SurfaceEventKind};

/// Minimal one-shot HTTP server for transport tests
#[cfg(test)]
pub(crate) mod test_server {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel::{unbounded, Receiver};

    pub struct TestServer {
        pub base_url: String,
        requests: Receiver<String>,
    }

    impl TestServer {
        /// Request line of the single request served, e.g. `GET /x HTTP/1.1`
        pub fn request_line(&self) -> String {
            self.requests
                .recv_timeout(Duration::from_secs(5))
                .unwrap_or_default()
        }
    }

    /// Answer one request with `status`, `content_type`, and `body`, then close
    pub fn serve_once(status: &str, content_type: &str, body: Vec<u8>) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = unbounded();
        let head = format!(
            "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );

        thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let Ok(read_half) = stream.try_clone() else {
                return;
            };
            let mut reader = BufReader::new(read_half);
            let mut request_line = String::new();
            let _ = reader.read_line(&mut request_line);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) if line == "\r\n" => break,
                    Ok(_) => {}
                }
            }
            let _ = tx.send(request_line.trim_end().to_string());
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&body);
            let _ = stream.flush();
        });

        TestServer {
            base_url: format!("http://{addr}/"),
            requests: rx,
        }
    }
}
