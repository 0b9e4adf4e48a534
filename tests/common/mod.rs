//! Scripted fax server for integration tests.
//!
//! Speaks just enough of the control protocol for the client to log in,
//! move files over passive and active data connections, manage jobs and
//! register status triggers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Job 0 is the server's job template.
const TEMPLATE_JOB: u64 = 0;

#[derive(Default)]
pub struct ServerState {
    /// Password required after `user`; none means `user` alone logs in.
    pub password: Option<String>,
    pub files: HashMap<String, Vec<u8>>,
    pub jobs: HashMap<u64, HashMap<String, Vec<String>>>,
    pub next_job: u64,
    pub submitted: Vec<u64>,
    /// Every command line received, across all connections.
    pub commands: Vec<String>,
    /// Refuse this many upcoming transfers with `425`.
    pub refuse_transfers: usize,
    /// Lines pushed over each trigger connection.
    pub events: Vec<String>,
    /// Specs received with `site trigger`.
    pub triggers: Vec<String>,
    pub connections: usize,
    /// Answer this many upcoming `noop`s with an error.
    pub fail_noops: usize,
    pub next_unique: u64,
}

pub struct MockFaxServer {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    handle: JoinHandle<()>,
}

impl MockFaxServer {
    pub async fn start() -> Self {
        Self::start_with(ServerState::default()).await
    }

    pub async fn start_with(mut state: ServerState) -> Self {
        state.jobs.entry(TEMPLATE_JOB).or_default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(state));

        let shared = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.lock().unwrap().connections += 1;
                tokio::spawn(serve(stream, Arc::clone(&shared)));
            }
        });

        Self { addr, state, handle }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// How many received commands start with `verb`.
    pub fn count(&self, verb: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|line| line.split_whitespace().next() == Some(verb))
            .count()
    }
}

impl Drop for MockFaxServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

enum Data {
    Passive(TcpListener),
    Active(SocketAddr),
}

impl Data {
    async fn open(self) -> std::io::Result<TcpStream> {
        let limit = Duration::from_secs(5);
        let opened = match self {
            Data::Passive(listener) => timeout(limit, async { listener.accept().await.map(|(s, _)| s) }).await,
            Data::Active(addr) => timeout(limit, TcpStream::connect(addr)).await,
        };
        opened.unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()))
    }
}

struct Connection {
    state: Arc<Mutex<ServerState>>,
    writer: OwnedWriteHalf,
    current_job: u64,
    data: Option<Data>,
    rename_from: Option<String>,
    port_target: Option<SocketAddr>,
}

impl Connection {
    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    async fn reply(&mut self, text: &str) {
        let _ = self.writer.write_all(format!("{}\r\n", text).as_bytes()).await;
        let _ = self.writer.flush().await;
    }

    /// Send `payload` over the prepared data connection, bracketed by the
    /// preliminary and completion replies.
    async fn send_data(&mut self, opening: &str, payload: Vec<u8>) {
        let Some(data) = self.take_data().await else {
            return;
        };
        self.reply(opening).await;
        match data.open().await {
            Ok(mut stream) => {
                let _ = stream.write_all(&payload).await;
                let _ = stream.shutdown().await;
                self.reply("226 Transfer complete.").await;
            }
            Err(_) => self.reply("425 Cannot open data connection.").await,
        }
    }

    async fn receive_data(&mut self, opening: &str) -> Option<Vec<u8>> {
        let data = self.take_data().await?;
        self.reply(opening).await;
        match data.open().await {
            Ok(mut stream) => {
                let mut payload = Vec::new();
                let _ = stream.read_to_end(&mut payload).await;
                self.reply("226 Transfer complete.").await;
                Some(payload)
            }
            Err(_) => {
                self.reply("425 Cannot open data connection.").await;
                None
            }
        }
    }

    /// The prepared data endpoint, unless the transfer is refused.
    async fn take_data(&mut self) -> Option<Data> {
        let Some(data) = self.data.take() else {
            self.reply("425 Use PORT or PASV first.").await;
            return None;
        };
        let refuse = {
            let mut state = self.state();
            if state.refuse_transfers > 0 {
                state.refuse_transfers -= 1;
                true
            } else {
                false
            }
        };
        if refuse {
            drop(data);
            self.reply("425 Cannot open data connection.").await;
            return None;
        }
        Some(data)
    }

    fn take_noop_failure(&self) -> bool {
        let mut state = self.state();
        if state.fail_noops > 0 {
            state.fail_noops -= 1;
            true
        } else {
            false
        }
    }

    fn job_arg(&self, arg: &str) -> u64 {
        arg.trim().parse().unwrap_or(self.current_job)
    }

    async fn handle(&mut self, verb: &str, arg: &str) -> bool {
        match verb {
            "user" => {
                let needs_password = self.state().password.is_some();
                if needs_password {
                    self.reply(&format!("331 Password required for {}.", arg)).await;
                } else {
                    self.reply(&format!("230 User {} logged in.", arg)).await;
                }
            }
            "pass" => {
                let matches = self.state().password.as_deref() == Some(arg);
                if matches {
                    self.reply("230 User logged in.").await;
                } else {
                    self.reply("530 Login incorrect.").await;
                }
            }
            "admin" => self.reply("230 Administrative privileges established.").await,
            "quit" => {
                self.reply("221 Goodbye.").await;
                return false;
            }
            "noop" if self.take_noop_failure() => {
                self.reply("500 Service not available right now.").await
            }
            "noop" | "type" | "mode" | "tzone" | "jrest" => {
                self.reply("200 Command okay.").await
            }
            "idle" if arg.is_empty() => self.reply("213 Idle timeout is 900 seconds.").await,
            "idle" => self.reply(&format!("213 Idle timeout set to {}.", arg)).await,
            "pwd" => self.reply("257 \"/\" is the current directory.").await,
            "cwd" | "cdup" => self.reply("250 CWD command successful.").await,
            "size" => {
                let size = self.state().files.get(arg).map(Vec::len);
                match size {
                    Some(size) => self.reply(&format!("213 {}", size)).await,
                    None => self.reply("550 No such file").await,
                }
            }
            "mdtm" => {
                let exists = self.state().files.contains_key(arg);
                if exists {
                    self.reply("213 20240102030405").await;
                } else {
                    self.reply("550 No such file").await;
                }
            }
            "dele" => {
                let removed = self.state().files.remove(arg).is_some();
                if removed {
                    self.reply("250 DELE command successful.").await;
                } else {
                    self.reply("550 No such file").await;
                }
            }
            "rnfr" => {
                let exists = self.state().files.contains_key(arg);
                if exists {
                    self.rename_from = Some(arg.to_string());
                    self.reply("350 File exists, ready for destination name.").await;
                } else {
                    self.reply("550 No such file").await;
                }
            }
            "rnto" => {
                let from = self.rename_from.take();
                let moved = from.and_then(|from| {
                    let mut state = self.state();
                    let content = state.files.remove(&from)?;
                    state.files.insert(arg.to_string(), content);
                    Some(())
                });
                match moved {
                    Some(()) => self.reply("250 RNTO command successful.").await,
                    None => self.reply("503 Bad sequence of commands.").await,
                }
            }
            "pasv" => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                self.data = Some(Data::Passive(listener));
                self.reply(&format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})",
                    port / 256,
                    port % 256
                ))
                .await;
            }
            "port" => match parse_port(arg) {
                Some(addr) => {
                    self.data = Some(Data::Active(addr));
                    self.port_target = Some(addr);
                    self.reply("200 PORT command successful.").await;
                }
                None => self.reply("501 Syntax error in parameters.").await,
            },
            "retr" => {
                let content = self.state().files.get(arg).cloned();
                match content {
                    Some(content) => {
                        self.send_data("150 Opening BINARY mode data connection.", content)
                            .await
                    }
                    None => {
                        self.data = None;
                        self.reply("550 No such file").await;
                    }
                }
            }
            "list" | "nlst" => {
                let mut names: Vec<(String, usize)> = self
                    .state()
                    .files
                    .iter()
                    .map(|(name, content)| (name.clone(), content.len()))
                    .collect();
                names.sort();
                let listing: String = names
                    .iter()
                    .map(|(name, size)| {
                        if verb == "list" {
                            format!("-rw-r--r-- 1 fax fax {} {}\r\n", size, name)
                        } else {
                            format!("{}\r\n", name)
                        }
                    })
                    .collect();
                self.send_data("150 Opening ASCII mode data connection.", listing.into_bytes())
                    .await;
            }
            "stor" => {
                if let Some(payload) = self
                    .receive_data("150 Opening BINARY mode data connection.")
                    .await
                {
                    self.state().files.insert(arg.to_string(), payload);
                }
            }
            "stou" | "stot" => {
                let name = {
                    let mut state = self.state();
                    state.next_unique += 1;
                    format!("/tmp/doc{}.ps", state.next_unique)
                };
                let opening = format!("150 FILE: {} (Opening new data connection).", name);
                if let Some(payload) = self.receive_data(&opening).await {
                    self.state().files.insert(name, payload);
                }
            }
            "jnew" => {
                let id = {
                    let mut state = self.state();
                    state.next_job += 1;
                    let id = state.next_job;
                    state.jobs.insert(id, HashMap::new());
                    id
                };
                self.current_job = id;
                self.reply(&format!("200 New job created: jobid: {} groupid: {}.", id, id))
                    .await;
            }
            "job" => {
                if arg.is_empty() {
                    let current = self.current_job;
                    self.reply(&format!("200 Current job: jobid: {} groupid: {}.", current, current))
                        .await;
                } else if arg == "default" {
                    self.current_job = TEMPLATE_JOB;
                    self.reply("200 Current job: default.").await;
                } else {
                    let id = self.job_arg(arg);
                    let known = self.state().jobs.contains_key(&id);
                    if known {
                        self.current_job = id;
                        self.reply(&format!("200 Current job: jobid: {} groupid: {}.", id, id))
                            .await;
                    } else {
                        self.reply(&format!("500 Unknown job \"{}\".", arg)).await;
                    }
                }
            }
            "jparm" => {
                let (name, value) = match arg.split_once(' ') {
                    Some((name, value)) => (name.to_lowercase(), Some(value.to_string())),
                    None => (arg.to_lowercase(), None),
                };
                let job = self.current_job;
                match value {
                    Some(value) => {
                        {
                            let mut state = self.state();
                            let params = state.jobs.entry(job).or_default();
                            if name == "document" {
                                params.entry(name.clone()).or_default().push(value);
                            } else {
                                params.insert(name.clone(), vec![value]);
                            }
                        }
                        self.reply(&format!("213 {} set.", name.to_uppercase())).await;
                    }
                    None => {
                        let values = self
                            .state()
                            .jobs
                            .get(&job)
                            .and_then(|params| params.get(&name).cloned())
                            .unwrap_or_default();
                        if name == "document" {
                            for path in &values {
                                self.reply(&format!("213-PS {}", path)).await;
                            }
                            self.reply("213 End of documents.").await;
                        } else {
                            let value = values.first().cloned().unwrap_or_default();
                            self.reply(&format!("213 {}", value)).await;
                        }
                    }
                }
            }
            "jsubm" => {
                let id = self.job_arg(arg);
                if id == TEMPLATE_JOB {
                    self.reply("503 Cannot submit the default job.").await;
                } else {
                    self.state().submitted.push(id);
                    self.reply(&format!("200 Job {} submitted.", id)).await;
                }
            }
            "jsusp" | "jkill" | "jintr" | "jdele" => {
                let id = self.job_arg(arg);
                self.reply(&format!("200 Job {} {}.", id, verb)).await;
            }
            "jwait" => {
                let id = self.job_arg(arg);
                self.reply(&format!("216 Job {} done.", id)).await;
            }
            "jobfmt" | "mdmfmt" | "rcvfmt" | "filefmt" => {
                if arg.is_empty() {
                    self.reply(&format!("200 {} is \"%-4j %3i\"", verb.to_uppercase()))
                        .await;
                } else {
                    self.reply(&format!("200 {} set.", verb.to_uppercase())).await;
                }
            }
            "site" => match arg.split_once(' ') {
                Some(("trigger", spec)) => self.trigger(spec.to_string()).await,
                _ => self.reply("200 Command okay.").await,
            },
            _ => self.reply("500 Command not recognized.").await,
        }
        true
    }

    /// Connect back to the announced address and push the scripted events.
    async fn trigger(&mut self, spec: String) {
        let Some(target) = self.port_target.take() else {
            self.reply("425 Use PORT first.").await;
            return;
        };
        self.data = None;
        let events = {
            let mut state = self.state();
            state.triggers.push(spec);
            state.events.clone()
        };
        self.reply("150 Trigger registered.").await;

        tokio::spawn(async move {
            let Ok(mut stream) = TcpStream::connect(target).await else {
                return;
            };
            for event in events {
                if stream.write_all(format!("{}\n", event).as_bytes()).await.is_err() {
                    return;
                }
            }
            // Hold the connection until the client closes it.
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<ServerState>>) {
    let (reader, writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut connection = Connection {
        state,
        writer,
        current_job: TEMPLATE_JOB,
        data: None,
        rename_from: None,
        port_target: None,
    };
    connection.reply("220 mock fax server ready").await;

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        connection.state().commands.push(line.clone());
        let (verb, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        if !connection.handle(&verb.to_lowercase(), arg.trim()).await {
            break;
        }
    }
}

fn parse_port(arg: &str) -> Option<SocketAddr> {
    let parts: Vec<u8> = arg
        .split(',')
        .map(|part| part.trim().parse().ok())
        .collect::<Option<_>>()?;
    if parts.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(parts[0], parts[1], parts[2], parts[3]);
    let port = u16::from(parts[4]) * 256 + u16::from(parts[5]);
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}
