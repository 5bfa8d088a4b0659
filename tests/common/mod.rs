//! In-process memserver stand-in for integration tests.
//!
//! Speaks the wire protocol over a real loopback socket: decodes
//! `<id><segments>` requests, runs them against an in-memory store and writes
//! `<id><payload>` replies in the configured framing.

#![allow(dead_code)]

use memserver_client::protocol::{parse_args, parse_segment, REQUEST_ID_LEN};
use memserver_client::{Command, Framing, SetOption};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

pub type RawRequest = ([u8; REQUEST_ID_LEN], Vec<String>);

/// How the mock treats decoded requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Execute and reply. With `shuffle`, replies to requests that arrived in
    /// the same read are written in reverse order.
    Serve { shuffle: bool },
    /// Read requests, never reply.
    Silent,
}

#[derive(Default)]
struct Store {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
}

pub struct MockServer {
    pub addr: SocketAddr,
    bytes_received: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    kill: watch::Sender<bool>,
}

impl MockServer {
    pub async fn start(framing: Framing, behavior: Behavior) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(Mutex::new(Store::default()));
        let bytes_received = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        let (kill, kill_rx) = watch::channel(false);

        let conn_bytes = Arc::clone(&bytes_received);
        let conn_requests = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_connection(
                    stream,
                    Arc::clone(&store),
                    framing,
                    behavior,
                    Arc::clone(&conn_bytes),
                    Arc::clone(&conn_requests),
                    kill_rx.clone(),
                ));
            }
        });

        MockServer {
            addr,
            bytes_received,
            requests,
            kill,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Total bytes read from all clients so far.
    pub fn bytes_received(&self) -> usize {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// Total requests decoded so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Drop every open client connection.
    pub fn kill_connections(&self) {
        self.kill.send_replace(true);
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    store: Arc<Mutex<Store>>,
    framing: Framing,
    behavior: Behavior,
    bytes_received: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    mut kill: watch::Receiver<bool>,
) {
    let mut decoder = RequestDecoder::default();
    let mut buf = vec![0u8; 8192];

    loop {
        let n = tokio::select! {
            _ = kill.changed() => return,
            read = stream.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            },
        };
        bytes_received.fetch_add(n, Ordering::SeqCst);
        decoder.feed(&buf[..n]);

        let mut replies = Vec::new();
        while let Some((id, args)) = decoder.next_request() {
            requests.fetch_add(1, Ordering::SeqCst);
            if let Behavior::Serve { .. } = behavior {
                let payload = execute(&mut store.lock().unwrap(), args);
                replies.push(framing.encode_reply(&id, &payload));
            }
        }

        if behavior == (Behavior::Serve { shuffle: true }) {
            replies.reverse();
        }
        for reply in replies {
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}

/// Incremental decoder for outbound client frames.
///
/// Frames carry no length, so the argument count is derived from the verb;
/// variadic commands take the rest of the buffer when it decodes cleanly.
/// Decoded requests are turned back into commands with `Command::from_args`.
#[derive(Default)]
pub struct RequestDecoder {
    buf: Vec<u8>,
}

impl RequestDecoder {
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_request(&mut self) -> Option<RawRequest> {
        let (request, consumed) = decode(&self.buf)?;
        self.buf.drain(..consumed);
        Some(request)
    }

    /// Read from `reader` until one full request is available.
    pub async fn read_request<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Option<RawRequest> {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(request) = self.next_request() {
                return Some(request);
            }
            let n = reader.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            self.feed(&buf[..n]);
        }
    }
}

fn decode(buf: &[u8]) -> Option<(RawRequest, usize)> {
    if buf.len() < REQUEST_ID_LEN {
        return None;
    }
    let mut id = [0u8; REQUEST_ID_LEN];
    id.copy_from_slice(&buf[..REQUEST_ID_LEN]);
    let mut offset = REQUEST_ID_LEN;

    let (verb, used) = parse_segment(&buf[offset..]).expect("malformed verb")?;
    offset += used;

    let (fixed, variadic) = match verb.as_str() {
        "GET" => (1, false),
        "APPEND" | "HGET" => (2, false),
        "SET" => (2, true),
        _ => (1, true),
    };

    let mut args = vec![verb];
    for _ in 0..fixed {
        let (arg, used) = parse_segment(&buf[offset..]).expect("malformed argument")?;
        args.push(arg);
        offset += used;
    }
    // A variadic tail only counts if everything left decodes as segments;
    // otherwise the remainder starts with the next request's id.
    if variadic {
        if let Ok(rest) = parse_args(&buf[offset..]) {
            args.extend(rest);
            offset = buf.len();
        }
    }

    Some(((id, args), offset))
}

fn execute(store: &mut Store, args: Vec<String>) -> Vec<u8> {
    let command = match Command::from_args(args) {
        Ok(command) => command,
        Err(e) => return format!("ERR {}", e).into_bytes(),
    };

    let reply = match command {
        Command::Get { key } => store.strings.get(&key).cloned().unwrap_or_default(),
        Command::Set {
            key,
            value,
            options,
        } => {
            let flags: Vec<String> = options
                .into_iter()
                .flat_map(|option| match option {
                    SetOption::Other(clause) => clause,
                    SetOption::Nx => vec!["NX".to_string()],
                    SetOption::Xx => vec!["XX".to_string()],
                    _ => Vec::new(),
                })
                .map(|flag| flag.to_uppercase())
                .collect();
            let exists = store.strings.contains_key(&key);
            let has = |flag: &str| flags.iter().any(|f| f == flag);
            if (has("NX") && exists) || (has("XX") && !exists) {
                String::new()
            } else {
                store.strings.insert(key, value);
                "OK".to_string()
            }
        }
        Command::Del { keys } => keys
            .iter()
            .filter(|k| store.strings.remove(*k).is_some() | store.hashes.remove(*k).is_some())
            .count()
            .to_string(),
        Command::Exists { keys } => keys
            .iter()
            .filter(|k| store.strings.contains_key(*k) || store.hashes.contains_key(*k))
            .count()
            .to_string(),
        Command::Append { key, value } => {
            let stored = store.strings.entry(key).or_default();
            stored.push_str(&value);
            stored.len().to_string()
        }
        Command::MultiSet { args } => {
            for pair in args.chunks(2) {
                if let [key, value] = pair {
                    store.strings.insert(key.clone(), value.clone());
                }
            }
            "OK".to_string()
        }
        Command::HashSet { key, fields } => {
            let hash = store.hashes.entry(key).or_default();
            fields
                .chunks(2)
                .filter(|pair| pair.len() == 2 && hash.insert(pair[0].clone(), pair[1].clone()).is_none())
                .count()
                .to_string()
        }
        Command::HashGet { key, field } => store
            .hashes
            .get(&key)
            .and_then(|hash| hash.get(&field))
            .cloned()
            .unwrap_or_default(),
        Command::HashGetAll { key, fields } => match store.hashes.get(&key) {
            Some(hash) => fields
                .iter()
                .filter_map(|field| hash.get(field).map(|v| format!("{}={}", field, v)))
                .collect::<Vec<_>>()
                .join("\n"),
            None => String::new(),
        },
        Command::HashDel { key, fields } => match store.hashes.get_mut(&key) {
            Some(hash) => fields
                .iter()
                .filter(|field| hash.remove(*field).is_some())
                .count()
                .to_string(),
            None => "0".to_string(),
        },
    };
    reply.into_bytes()
}

/// Poll `condition` until it holds, panicking after `limit`.
pub async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within {:?}", limit);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
