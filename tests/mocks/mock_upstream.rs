//! Stands in for a broker/exchange gateway across the integration tests:
//! a plain `TcpListener` that hands each accepted connection to the test
//! over a channel, the way the teacher's `mocks::MockWebServer` stood in
//! for an upstream HTTP server. No protocol framing of its own -- tests
//! write/drop raw bytes on the accepted socket directly so they control
//! timing precisely (mid-message splits, abrupt disconnects).

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

pub struct MockUpstream {
    pub addr: SocketAddr,
    accepted: Receiver<TcpStream>,
}

impl MockUpstream {
    pub fn start() -> MockUpstream {
        let listener = TcpListener::bind("127.0.0.1:0").expect("mock upstream bind failed");
        let addr = listener.local_addr().expect("mock upstream local_addr failed");
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("mock-upstream".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(s) => {
                            if tx.send(s).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
            .expect("could not spawn mock upstream thread");
        MockUpstream { addr, accepted: rx }
    }

    /// Blocks for the next accepted connection. A generous timeout turns a
    /// stuck connect (a real bug) into a failing test instead of a hang.
    pub fn accept(&self) -> TcpStream {
        self.accepted
            .recv_timeout(Duration::from_secs(5))
            .expect("no connection accepted within timeout")
    }
}
