//! A minimal command-line client built on `streamcore`: reads an
//! `EndpointConfig` from a file, connects a `StreamClientService`, and
//! prints each decoded line to stdout as it arrives. Exists to exercise the
//! crate end-to-end the way the teacher's own `main.rs` exercised
//! `linkerd-tcp` against a config file, not as a complete trading client.

#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
extern crate pretty_env_logger;
extern crate rustls;
extern crate streamcore;

use std::fs;
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{App, Arg};

use streamcore::client::{DisconnectSink, LogTag, StreamClient};
use streamcore::config;
use streamcore::decoder::{Decoder, ProtocolSignal};
use streamcore::error::ClientError;
use streamcore::measurement::MeasurementToken;
use streamcore::service::{ServiceHooks, StreamClientService};

static CONFIG_PATH_ARG: &'static str = "PATH";

fn mk_app() -> App<'static, 'static> {
    App::new(crate_name!())
        .version(crate_version!())
        .about("Connects to a single endpoint and prints received lines.")
        .arg(
            Arg::with_name(CONFIG_PATH_ARG)
                .required(true)
                .index(1)
                .help("Endpoint config file path (JSON or YAML)."),
        )
}

/// Same `\r\n`-terminated framing as `decoder::LineDecoder`, but prints each
/// message as it's decoded instead of buffering it for later inspection --
/// this is the difference between a test fixture and something a user
/// watches scroll by.
#[derive(Default)]
struct PrintingDecoder {
    log_tag: String,
}

impl Decoder for PrintingDecoder {
    fn find_last_message_last_byte(
        &self,
        buf: &[u8],
        _buffer_begin: usize,
        transfer_begin: usize,
        transfer_end: usize,
    ) -> Result<usize, ProtocolSignal> {
        let window = &buf[transfer_begin..transfer_end];
        let mut last_end = None;
        let mut i = 0;
        while i + 1 < window.len() {
            if window[i] == b'\r' && window[i + 1] == b'\n' {
                last_end = Some(transfer_begin + i + 2);
                i += 2;
            } else {
                i += 1;
            }
        }
        Ok(last_end.unwrap_or(transfer_end))
    }

    fn handle_new_messages(
        &mut self,
        _now: ::std::time::SystemTime,
        buf: &[u8],
        buffer_begin: usize,
        last_byte_inclusive: usize,
        _measurement: MeasurementToken,
    ) -> Result<(), ProtocolSignal> {
        let region = &buf[buffer_begin..last_byte_inclusive];
        let mut start = 0;
        let mut i = 0;
        while i + 1 < region.len() {
            if region[i] == b'\r' && region[i + 1] == b'\n' {
                let line = String::from_utf8_lossy(&region[start..i]);
                println!("{}", line);
                i += 2;
                start = i;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    fn get_log_tag(&self) -> &str {
        &self.log_tag
    }
}

struct DemoHooks {
    log_tag: LogTag,
    resolved: config::ResolvedConfig,
}

impl ServiceHooks<PrintingDecoder> for DemoHooks {
    fn create_client(
        &self,
        disconnect_sink: Arc<dyn DisconnectSink>,
    ) -> Result<Arc<StreamClient<PrintingDecoder>>, ClientError> {
        let tls_config = if self.resolved.secure {
            Some(Arc::new(rustls::ClientConfig::new()))
        } else {
            None
        };
        let decoder = PrintingDecoder {
            log_tag: self.log_tag.as_str().to_owned(),
        };
        StreamClient::connect(
            self.log_tag.clone(),
            &self.resolved,
            tls_config,
            decoder,
            disconnect_sink,
        )
    }

    fn on_connection_restored(&self) {
        info!("{}connection restored", self.log_tag);
    }

    fn on_stop_by_error(&self, message: &str) {
        error!("{}{}", self.log_tag, message);
    }
}

fn main() {
    pretty_env_logger::init().expect("could not initialize logger");

    let opts = mk_app().get_matches();
    let config_path = opts.value_of(CONFIG_PATH_ARG).unwrap();
    let config_str = {
        let mut s = String::new();
        fs::File::open(config_path)
            .expect("could not open config file")
            .read_to_string(&mut s)
            .expect("could not read config file");
        s
    };

    let endpoint = config::from_str(&config_str).expect("configuration error");
    let resolved = endpoint.resolve().expect("invalid configuration");
    let log_tag = LogTag::new(format!("{}:{}", resolved.host, resolved.port));

    let hooks = Arc::new(DemoHooks {
        log_tag: log_tag.clone(),
        resolved: resolved.clone(),
    });
    let service = StreamClientService::new(log_tag, resolved, hooks);

    service.connect().expect("initial connect failed");
    info!("connected, waiting for messages (ctrl-c to exit)");

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
