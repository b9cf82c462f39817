//! A scripted PostgreSQL backend for end-to-end tests.
//!
//! Each accepted socket is served by its own thread speaking just enough of
//! protocol 3.0 to exercise the client: startup and authentication, simple
//! and extended queries, COPY in both directions and LISTEN/NOTIFY between
//! sessions.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::auth::md5_password;
use crate::config::{PgConfig, SslMode};
use crate::statement::count_placeholders;

const SSL_REQUEST_CODE: i32 = 80877103;
const PROTOCOL_VERSION: i32 = 196608;
const SERVER_VERSION: &str = "16.0";
const MD5_SALT: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

#[derive(Debug, Clone, Copy)]
pub enum MockAuth {
    Trust,
    Cleartext(&'static str),
    Md5(&'static str),
}

/// Counters shared by every session of one server.
#[derive(Default)]
pub struct MockStats {
    pub connections: AtomicUsize,
    pub parses: AtomicUsize,
    pub executes: AtomicUsize,
    pub closes: AtomicUsize,
    pub terminates: AtomicUsize,
    next_pid: AtomicI32,
    /// LISTEN registrations: backend pid, channel and a handle to its socket.
    listeners: Mutex<Vec<(i32, String, TcpStream)>>,
}

impl MockStats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn parses(&self) -> usize {
        self.parses.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn terminates(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }
}

pub struct MockServer {
    addr: SocketAddr,
    stats: Arc<MockStats>,
}

impl MockServer {
    pub fn start(auth: MockAuth) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let stats = Arc::new(MockStats {
            next_pid: AtomicI32::new(1000),
            ..MockStats::default()
        });

        let shared = Arc::clone(&stats);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                shared.connections.fetch_add(1, Ordering::SeqCst);
                let stats = Arc::clone(&shared);
                thread::spawn(move || {
                    let _ = Session::new(stream, stats).run(auth);
                });
            }
        });

        Self { addr, stats }
    }

    /// Options pointing at this server. `sslmode=prefer` so the SSLRequest
    /// exchange is exercised too; the server always declines.
    pub fn config(&self) -> PgConfig {
        PgConfig::default()
            .host("127.0.0.1")
            .port(self.addr.port())
            .user("tester")
            .database("test")
            .ssl_mode(SslMode::Prefer)
    }

    pub fn stats(&self) -> &MockStats {
        &self.stats
    }
}

/// Options for a port nobody listens on.
pub fn dead_config() -> PgConfig {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("address").port();
    drop(listener);
    PgConfig::default()
        .host("127.0.0.1")
        .port(port)
        .ssl_mode(SslMode::Disable)
}

// ============================================================================
// Message construction
// ============================================================================

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(tag);
    out.extend_from_slice(&(body.len() as i32 + 4).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn put_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn error_body(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
        body.push(field);
        put_cstr(&mut body, value);
    }
    body.push(0);
    body
}

fn notification(pid: i32, channel: &str, payload: &str) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    put_cstr(&mut body, channel);
    put_cstr(&mut body, payload);
    frame(b'A', &body)
}

/// Cursor over a message body.
struct Body<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Body<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u8(&mut self) -> u8 {
        let b = self.data[self.pos];
        self.pos += 1;
        b
    }

    fn i16(&mut self) -> i16 {
        let v = i16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        v
    }

    fn i32(&mut self) -> i32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        i32::from_be_bytes(b)
    }

    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        s
    }

    fn cstr(&mut self) -> String {
        let end = self.data[self.pos..]
            .iter()
            .position(|&b| b == 0)
            .expect("unterminated string");
        let s = String::from_utf8_lossy(&self.data[self.pos..self.pos + end]).into_owned();
        self.pos += end + 1;
        s
    }
}

// ============================================================================
// Session
// ============================================================================

struct Statement {
    query: String,
    param_types: Vec<i32>,
}

struct Portal {
    query: String,
    params: Vec<Option<Vec<u8>>>,
}

struct Session {
    stream: TcpStream,
    stats: Arc<MockStats>,
    pid: i32,
    status: u8,
    user: String,
    statements: HashMap<String, Statement>,
    portal: Option<Portal>,
    /// Extended-protocol error seen; ignore messages until Sync.
    skipping: bool,
}

impl Session {
    fn new(stream: TcpStream, stats: Arc<MockStats>) -> Self {
        let pid = stats.next_pid.fetch_add(1, Ordering::SeqCst);
        Self {
            stream,
            stats,
            pid,
            status: b'I',
            user: String::new(),
            statements: HashMap::new(),
            portal: None,
            skipping: false,
        }
    }

    fn send(&mut self, tag: u8, body: &[u8]) -> io::Result<()> {
        self.stream.write_all(&frame(tag, body))
    }

    fn send_error(&mut self, code: &str, message: &str) -> io::Result<()> {
        if self.status == b'T' {
            self.status = b'E';
        }
        self.send(b'E', &error_body("ERROR", code, message))
    }

    fn command_complete(&mut self, tag: &str) -> io::Result<()> {
        let mut body = Vec::new();
        put_cstr(&mut body, tag);
        self.send(b'C', &body)
    }

    fn ready(&mut self) -> io::Result<()> {
        let status = self.status;
        self.send(b'Z', &[status])
    }

    fn read_untagged(&mut self) -> io::Result<Vec<u8>> {
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len)?;
        let mut body = vec![0u8; i32::from_be_bytes(len) as usize - 4];
        self.stream.read_exact(&mut body)?;
        Ok(body)
    }

    fn read_message(&mut self) -> io::Result<(u8, Vec<u8>)> {
        let mut tag = [0u8; 1];
        self.stream.read_exact(&mut tag)?;
        Ok((tag[0], self.read_untagged()?))
    }

    fn run(mut self, auth: MockAuth) -> io::Result<()> {
        if !self.startup(auth)? {
            return Ok(());
        }

        loop {
            let (tag, body) = self.read_message()?;
            match tag {
                b'Q' => {
                    let query = Body::new(&body).cstr();
                    self.simple_query(&query)?;
                }
                b'P' | b'D' | b'B' | b'E' | b'C' if self.skipping => {}
                b'P' => self.parse(&body)?,
                b'D' => self.describe(&body)?,
                b'B' => self.bind(&body)?,
                b'E' => self.execute()?,
                b'C' => {
                    let mut body = Body::new(&body);
                    body.u8();
                    let name = body.cstr();
                    self.statements.remove(&name);
                    self.stats.closes.fetch_add(1, Ordering::SeqCst);
                    self.send(b'3', &[])?;
                }
                b'S' => {
                    self.skipping = false;
                    self.portal = None;
                    self.ready()?;
                }
                b'X' => {
                    self.stats.terminates.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    fn startup(&mut self, auth: MockAuth) -> io::Result<bool> {
        loop {
            let body = self.read_untagged()?;
            let mut body = Body::new(&body);
            match body.i32() {
                SSL_REQUEST_CODE => self.stream.write_all(b"N")?,
                PROTOCOL_VERSION => {
                    loop {
                        let key = body.cstr();
                        if key.is_empty() {
                            break;
                        }
                        let value = body.cstr();
                        if key == "user" {
                            self.user = value;
                        }
                    }
                    break;
                }
                other => panic!("unexpected startup code {other}"),
            }
        }

        let expected = match auth {
            MockAuth::Trust => None,
            MockAuth::Cleartext(password) => {
                self.send(b'R', &3i32.to_be_bytes())?;
                Some(password.to_string())
            }
            MockAuth::Md5(password) => {
                let mut body = 5i32.to_be_bytes().to_vec();
                body.extend_from_slice(&MD5_SALT);
                self.send(b'R', &body)?;
                Some(md5_password(&self.user, password, &MD5_SALT))
            }
        };
        if let Some(expected) = expected {
            let (tag, body) = self.read_message()?;
            assert_eq!(tag, b'p', "expected a password message");
            if Body::new(&body).cstr() != expected {
                let user = self.user.clone();
                self.send(
                    b'E',
                    &error_body(
                        "FATAL",
                        "28P01",
                        &format!("password authentication failed for user \"{user}\""),
                    ),
                )?;
                return Ok(false);
            }
        }

        self.send(b'R', &0i32.to_be_bytes())?;
        let mut body = Vec::new();
        put_cstr(&mut body, "server_version");
        put_cstr(&mut body, SERVER_VERSION);
        self.send(b'S', &body)?;
        let mut body = self.pid.to_be_bytes().to_vec();
        body.extend_from_slice(&77i32.to_be_bytes());
        self.send(b'K', &body)?;
        self.ready()?;
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Simple query
    // ------------------------------------------------------------------------

    fn simple_query(&mut self, query: &str) -> io::Result<()> {
        let statements: Vec<&str> = query
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if statements.is_empty() {
            self.send(b'I', &[])?;
        }
        for statement in statements {
            if !self.simple_statement(statement)? {
                break;
            }
        }
        self.ready()
    }

    /// Returns `false` once a statement failed.
    fn simple_statement(&mut self, sql: &str) -> io::Result<bool> {
        let upper = sql.to_uppercase();

        if self.status == b'E' && upper != "ROLLBACK" && upper != "COMMIT" {
            self.send_error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            )?;
            return Ok(false);
        }

        match upper.as_str() {
            "BEGIN" => {
                self.status = b'T';
                self.command_complete("BEGIN")?;
            }
            "COMMIT" | "ROLLBACK" => {
                let tag = if self.status == b'E' { "ROLLBACK" } else { upper.as_str() };
                let tag = tag.to_string();
                self.status = b'I';
                self.command_complete(&tag)?;
            }
            "SELECT 1" => {
                self.row_description(&[("?column?", 23)])?;
                self.data_row(&[Some(b"1".to_vec())])?;
                self.command_complete("SELECT 1")?;
            }
            "SELECT GENERATE_SERIES(1, 10)" => {
                self.row_description(&[("generate_series", 23)])?;
                for i in 1..=10 {
                    self.data_row(&[Some(i.to_string().into_bytes())])?;
                }
                self.command_complete("SELECT 10")?;
            }
            "UNLISTEN *" => {
                let pid = self.pid;
                self.stats.listeners.lock().retain(|(p, _, _)| *p != pid);
                self.command_complete("UNLISTEN")?;
            }
            _ if upper.starts_with("LISTEN ") => {
                let channel = unquote_identifier(&sql[7..]);
                let handle = self.stream.try_clone()?;
                self.stats
                    .listeners
                    .lock()
                    .push((self.pid, channel, handle));
                self.command_complete("LISTEN")?;
            }
            _ if upper.starts_with("UNLISTEN ") => {
                let channel = unquote_identifier(&sql[9..]);
                let pid = self.pid;
                self.stats
                    .listeners
                    .lock()
                    .retain(|(p, c, _)| !(*p == pid && *c == channel));
                self.command_complete("UNLISTEN")?;
            }
            _ if upper.starts_with("NOTIFY ") => {
                let (channel, payload) = sql[7..].split_once(", ").unwrap_or((&sql[7..], "''"));
                let channel = unquote_identifier(channel);
                let payload = unquote_literal(payload);
                self.command_complete("NOTIFY")?;
                let message = notification(self.pid, &channel, &payload);
                // Listeners whose socket is gone are dropped
                self.stats
                    .listeners
                    .lock()
                    .retain_mut(|(_, c, stream)| *c != channel || stream.write_all(&message).is_ok());
            }
            _ if upper.starts_with("DO ") => {
                self.send(b'N', &error_body("NOTICE", "00000", "just so you know"))?;
                self.command_complete("DO")?;
            }
            _ if upper.ends_with("FROM STDIN") => return self.copy_in(),
            _ if upper.ends_with("TO STDOUT") => {
                self.send(b'H', &[0, 0, 1, 0, 0])?;
                for row in ["1\n", "2\n", "3\n"] {
                    self.send(b'd', row.as_bytes())?;
                }
                self.send(b'c', &[])?;
                self.command_complete("COPY 3")?;
            }
            _ if upper.contains("ERROR") => {
                self.send_error("42601", "syntax error at or near \"error\"")?;
                return Ok(false);
            }
            _ => {
                let tag = upper.split_whitespace().next().unwrap_or("").to_string();
                self.command_complete(&tag)?;
            }
        }
        Ok(true)
    }

    fn copy_in(&mut self) -> io::Result<bool> {
        self.send(b'G', &[0, 0, 1, 0, 0])?;
        let mut data = Vec::new();
        loop {
            let (tag, body) = self.read_message()?;
            match tag {
                b'd' => data.extend_from_slice(&body),
                b'c' => break,
                b'f' => {
                    let reason = Body::new(&body).cstr();
                    self.send_error("57014", &format!("COPY from stdin failed: {reason}"))?;
                    return Ok(false);
                }
                // Flush and Sync are ignored while copying
                _ => {}
            }
        }

        let text = String::from_utf8_lossy(&data).into_owned();
        let rows: Vec<&str> = text.lines().filter(|l| !l.is_empty()).collect();
        if let Some(bad) = rows.iter().find(|row| **row == "bad") {
            let message = format!("invalid input syntax for type integer: \"{bad}\"");
            self.send_error("22P02", &message)?;
            return Ok(false);
        }
        self.command_complete(&format!("COPY {}", rows.len()))?;
        Ok(true)
    }

    fn row_description(&mut self, columns: &[(&str, i32)]) -> io::Result<()> {
        let mut body = (columns.len() as i16).to_be_bytes().to_vec();
        for (name, oid) in columns {
            put_cstr(&mut body, name);
            body.extend_from_slice(&0i32.to_be_bytes());
            body.extend_from_slice(&0i16.to_be_bytes());
            body.extend_from_slice(&oid.to_be_bytes());
            body.extend_from_slice(&(-1i16).to_be_bytes());
            body.extend_from_slice(&(-1i32).to_be_bytes());
            body.extend_from_slice(&0i16.to_be_bytes());
        }
        self.send(b'T', &body)
    }

    fn data_row(&mut self, values: &[Option<Vec<u8>>]) -> io::Result<()> {
        let mut body = (values.len() as i16).to_be_bytes().to_vec();
        for value in values {
            match value {
                Some(v) => {
                    body.extend_from_slice(&(v.len() as i32).to_be_bytes());
                    body.extend_from_slice(v);
                }
                None => body.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        self.send(b'D', &body)
    }

    // ------------------------------------------------------------------------
    // Extended query
    // ------------------------------------------------------------------------

    fn parse(&mut self, body: &[u8]) -> io::Result<()> {
        let mut body = Body::new(body);
        let name = body.cstr();
        let query = body.cstr();
        let declared: Vec<i32> = (0..body.i16()).map(|_| body.i32()).collect();

        if query.to_uppercase().contains("ERROR") {
            self.skipping = true;
            return self.send_error("42601", "syntax error at or near \"error\"");
        }

        // Unspecified parameters are inferred as text
        let param_types = (0..count_placeholders(&query))
            .map(|i| match declared.get(i).copied().unwrap_or(0) {
                0 => 25,
                oid => oid,
            })
            .collect();
        self.stats.parses.fetch_add(1, Ordering::SeqCst);
        self.statements.insert(name, Statement { query, param_types });
        self.send(b'1', &[])
    }

    fn describe(&mut self, body: &[u8]) -> io::Result<()> {
        let mut body = Body::new(body);
        assert_eq!(body.u8(), b'S', "only statements are described");
        let name = body.cstr();
        let Some(stmt) = self.statements.get(&name) else {
            self.skipping = true;
            return self.send_error("26000", &format!("prepared statement \"{name}\" does not exist"));
        };
        let types = stmt.param_types.clone();
        let returns_rows = stmt.query.to_uppercase().starts_with("SELECT");

        let mut description = (types.len() as i16).to_be_bytes().to_vec();
        for oid in &types {
            description.extend_from_slice(&oid.to_be_bytes());
        }
        self.send(b't', &description)?;

        if returns_rows {
            let names: Vec<String> = (1..=types.len()).map(|i| format!("c{i}")).collect();
            let columns: Vec<(&str, i32)> = names
                .iter()
                .map(String::as_str)
                .zip(types.iter().copied())
                .collect();
            self.row_description(&columns)
        } else {
            self.send(b'n', &[])
        }
    }

    fn bind(&mut self, body: &[u8]) -> io::Result<()> {
        let mut body = Body::new(body);
        let _portal = body.cstr();
        let name = body.cstr();
        for _ in 0..body.i16() {
            body.i16();
        }
        let mut params = Vec::new();
        for _ in 0..body.i16() {
            let len = body.i32();
            params.push((len >= 0).then(|| body.bytes(len as usize).to_vec()));
        }

        let Some(stmt) = self.statements.get(&name) else {
            self.skipping = true;
            return self.send_error("26000", &format!("prepared statement \"{name}\" does not exist"));
        };
        if params.len() != stmt.param_types.len() {
            self.skipping = true;
            let message = format!(
                "bind message supplies {} parameters, but prepared statement \"{name}\" requires {}",
                params.len(),
                stmt.param_types.len()
            );
            return self.send_error("08P01", &message);
        }
        self.portal = Some(Portal {
            query: stmt.query.clone(),
            params,
        });
        self.send(b'2', &[])
    }

    /// SELECT echoes the parameters back as one row; other statements
    /// affect one row.
    fn execute(&mut self) -> io::Result<()> {
        let Some(portal) = self.portal.take() else {
            self.skipping = true;
            return self.send_error("34000", "portal \"\" does not exist");
        };
        self.stats.executes.fetch_add(1, Ordering::SeqCst);

        let upper = portal.query.to_uppercase();
        if upper.starts_with("SELECT") {
            self.data_row(&portal.params)?;
            self.command_complete("SELECT 1")
        } else if upper.starts_with("INSERT") {
            self.command_complete("INSERT 0 1")
        } else {
            let tag = upper.split_whitespace().next().unwrap_or("").to_string();
            self.command_complete(&format!("{tag} 1"))
        }
    }
}

fn unquote_identifier(s: &str) -> String {
    let s = s.trim();
    match s.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => s.to_lowercase(),
    }
}

fn unquote_literal(s: &str) -> String {
    let s = s.trim();
    let (escaped, s) = match s.strip_prefix('E') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let inner = s
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(s)
        .replace("''", "'");
    if escaped {
        inner.replace("\\\\", "\\")
    } else {
        inner
    }
}
