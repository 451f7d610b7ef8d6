//! In-process fake backend for tests.
//!
//! Speaks enough of the v3 protocol to exercise the driver: cleartext and
//! MD5 authentication, the simple and extended query protocols, COPY in both
//! directions, notices, notifications and cancel requests. Query answers are
//! canned; see [`respond`].

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::protocol::CANCEL_REQUEST_CODE;

pub const USER: &str = "alice";
pub const PASSWORD: &str = "secret";
/// Authenticates with MD5 instead of cleartext
pub const MD5_USER: &str = "md5user";
pub const BACKEND_PID: i32 = 42;
pub const BACKEND_SECRET: i32 = 7;
pub const ITEMS_OID: u32 = 16384;
pub const NOTIFY_PID: i32 = 99;

const INT4: u32 = 23;
const TEXT: u32 = 25;

#[derive(Clone, Default)]
struct Shared {
    frontend: Arc<Mutex<Vec<u8>>>,
    cancels: Arc<Mutex<Vec<(i32, i32)>>>,
    param_types: Arc<Mutex<Vec<Vec<u32>>>>,
}

pub struct MockServer {
    addr: SocketAddr,
    shared: Shared,
    accept: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Shared::default();

        let sessions = shared.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = sessions.clone();
                tokio::spawn(async move {
                    let _ = Session::new(stream, shared).run().await;
                });
            }
        });

        Self {
            addr,
            shared,
            accept,
        }
    }

    /// Stop accepting connections. Open sessions keep running.
    pub async fn stop(&mut self) {
        self.accept.abort();
        let _ = (&mut self.accept).await;
    }

    pub fn config(&self) -> Config {
        Config::new()
            .host("127.0.0.1")
            .port(self.addr.port())
            .dbname("shop")
            .user(USER)
            .password(PASSWORD)
    }

    /// Type byte of every message received after startup, in order.
    pub fn frontend_messages(&self) -> Vec<u8> {
        self.shared.frontend.lock().clone()
    }

    /// Parameter type OIDs declared by every Parse message received.
    pub fn parse_param_types(&self) -> Vec<Vec<u32>> {
        self.shared.param_types.lock().clone()
    }

    /// Process id and secret key of every cancel request received.
    pub fn cancel_requests(&self) -> Vec<(i32, i32)> {
        self.shared.cancels.lock().clone()
    }
}

// ============================================================================
// Canned answers
// ============================================================================

struct Column {
    name: String,
    type_oid: u32,
    size: i16,
    table_oid: u32,
    attr: i16,
}

fn column(name: &str, type_oid: u32, size: i16) -> Column {
    Column {
        name: name.to_string(),
        type_oid,
        size,
        table_oid: 0,
        attr: 0,
    }
}

enum Reply {
    Rows {
        columns: Vec<Column>,
        rows: Vec<Vec<Option<String>>>,
    },
    Command(String),
    Empty,
    Error {
        code: &'static str,
        message: String,
    },
    Notice,
    Listen(String),
    SetParameter(String, String),
    CopyOut(Vec<&'static str>),
    CopyIn,
    /// FATAL error, then the session ends
    Terminate,
}

fn respond(sql: &str, params: &[Option<String>]) -> Reply {
    let sql = sql.trim();
    let param = |i: usize| params.get(i).cloned().flatten();

    if sql.is_empty() {
        return Reply::Empty;
    }
    if sql == "SELECT 1" {
        return Reply::Rows {
            columns: vec![column("?column?", INT4, 4)],
            rows: vec![vec![Some("1".to_string())]],
        };
    }
    if sql.contains("pg_attribute") {
        return catalog(sql.contains("pg_description"), param(0), param(1));
    }
    if sql.starts_with("SELECT relname FROM pg_class") {
        let rows = match param(0) {
            Some(oid) if oid == ITEMS_OID.to_string() => vec![vec![Some("items".to_string())]],
            _ => Vec::new(),
        };
        return Reply::Rows {
            columns: vec![column("relname", TEXT, 64)],
            rows,
        };
    }
    if let Some(rest) = sql.strip_prefix("SELECT * FROM ") {
        if rest.starts_with("items") || rest.starts_with("\"items\"") {
            return items(param(0));
        }
    }
    if sql.starts_with("SELECT $") {
        let n = param_count(sql);
        return Reply::Rows {
            columns: (1..=n).map(|i| column(&format!("p{}", i), TEXT, -1)).collect(),
            rows: vec![(0..n).map(param).collect()],
        };
    }
    if sql.starts_with("SELECT pg_terminate_backend") {
        return Reply::Terminate;
    }
    if sql.starts_with("INSERT") {
        return Reply::Command("INSERT 0 1".to_string());
    }
    if sql.starts_with("UPDATE") {
        return Reply::Command("UPDATE 2".to_string());
    }
    if sql.starts_with("DELETE") {
        return Reply::Command("DELETE 3".to_string());
    }
    if matches!(sql, "BEGIN" | "COMMIT" | "ROLLBACK") {
        return Reply::Command(sql.to_string());
    }
    if sql == "DO notice" {
        return Reply::Notice;
    }
    if let Some(channel) = sql.strip_prefix("LISTEN ") {
        return Reply::Listen(channel.to_string());
    }
    if let Some(rest) = sql.strip_prefix("SET ") {
        if let Some((name, value)) = rest.split_once(" TO ") {
            return Reply::SetParameter(name.to_string(), value.trim_matches('\'').to_string());
        }
    }
    if sql == "COPY items TO STDOUT" {
        return Reply::CopyOut(vec!["1\tapple\n", "2\t\\N\n", "3\tcherry\n"]);
    }
    if sql == "COPY items FROM STDIN" {
        return Reply::CopyIn;
    }
    if sql.starts_with("SELECT ") {
        return Reply::Error {
            code: "42703",
            message: "column \"bogus\" does not exist".to_string(),
        };
    }

    let word = sql.split_whitespace().next().unwrap_or_default();
    Reply::Error {
        code: "42601",
        message: format!("syntax error at or near \"{}\"", word),
    }
}

fn items(name: Option<String>) -> Reply {
    let mut id = column("id", INT4, 4);
    id.table_oid = ITEMS_OID;
    id.attr = 1;
    let mut label = column("name", TEXT, -1);
    label.table_oid = ITEMS_OID;
    label.attr = 2;

    let rows = [("1", Some("apple")), ("2", None), ("3", Some("cherry"))]
        .into_iter()
        .filter(|(_, n)| name.is_none() || name.as_deref() == *n)
        .map(|(i, n)| vec![Some(i.to_string()), n.map(str::to_string)])
        .collect();

    Reply::Rows {
        columns: vec![id, label],
        rows,
    }
}

fn catalog(extended: bool, table: Option<String>, schema: Option<String>) -> Reply {
    let mut names = vec![
        "attname",
        "attnum",
        "typname",
        "attlen",
        "attnotnull",
        "atthasdef",
        "attndims",
        "is_enum",
    ];
    if extended {
        names.extend(["is_base", "is_composite", "is_pseudo", "description"]);
    }

    let mut rows = Vec::new();
    if table.as_deref() == Some("items") && schema.as_deref() == Some("public") {
        let definitions = [
            (["id", "1", "int4", "4", "t", "f", "0", "f"], Some("row id")),
            (["name", "2", "text", "-1", "f", "f", "0", "f"], None),
        ];
        for (values, description) in definitions {
            let mut row: Vec<Option<String>> = values.iter().map(|v| Some(v.to_string())).collect();
            if extended {
                row.extend(["t", "f", "f"].iter().map(|v| Some(v.to_string())));
                row.push(description.map(str::to_string));
            }
            rows.push(row);
        }
    }

    Reply::Rows {
        columns: names.into_iter().map(|n| column(n, TEXT, -1)).collect(),
        rows,
    }
}

/// Highest `$n` placeholder in the query.
fn param_count(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
    for (i, _) in sql.match_indices('$') {
        let digits: String = bytes[i + 1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .map(|&b| char::from(b))
            .collect();
        if let Ok(n) = digits.parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

fn cstr(buf: &mut Bytes) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance((end + 1).min(buf.len()));
    s
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

// ============================================================================
// Session
// ============================================================================

struct Session {
    stream: TcpStream,
    shared: Shared,
    user: String,
    /// Transaction status byte sent with ReadyForQuery
    status: u8,
    statements: HashMap<String, String>,
    portal: Option<(String, Vec<Option<String>>)>,
    /// Skip extended-protocol messages until Sync
    failed: bool,
    out: BytesMut,
}

impl Session {
    fn new(stream: TcpStream, shared: Shared) -> Self {
        Self {
            stream,
            shared,
            user: String::new(),
            status: b'I',
            statements: HashMap::new(),
            portal: None,
            failed: false,
            out: BytesMut::new(),
        }
    }

    async fn run(mut self) -> io::Result<()> {
        if !self.startup().await? {
            return Ok(());
        }

        while let Some((tag, mut body)) = self.read_message().await? {
            self.shared.frontend.lock().push(tag);

            match tag {
                b'X' => return Ok(()),
                b'S' => {
                    self.failed = false;
                    self.ready();
                }
                _ if self.failed => {}
                b'Q' => {
                    let sql = cstr(&mut body);
                    if !self.simple_query(&sql).await? {
                        self.flush().await?;
                        return Ok(());
                    }
                }
                b'P' => self.parse(body),
                b'B' => self.bind(body),
                b'D' => self.describe(body),
                b'E' => self.execute(),
                b'C' => {
                    body.advance(1);
                    let name = cstr(&mut body);
                    self.statements.remove(&name);
                    self.message(b'3', &[]);
                }
                _ => {}
            }

            self.flush().await?;
        }

        Ok(())
    }

    async fn startup(&mut self) -> io::Result<bool> {
        let len = self.stream.read_i32().await?;
        let mut body = vec![0u8; (len as usize).saturating_sub(4)];
        self.stream.read_exact(&mut body).await?;
        let mut body = Bytes::from(body);

        let code = body.get_i32();
        if code == CANCEL_REQUEST_CODE {
            let process_id = body.get_i32();
            let secret_key = body.get_i32();
            self.shared.cancels.lock().push((process_id, secret_key));
            return Ok(false);
        }

        let mut params = HashMap::new();
        while body.has_remaining() && body[0] != 0 {
            let key = cstr(&mut body);
            let value = cstr(&mut body);
            params.insert(key, value);
        }
        self.user = params.remove("user").unwrap_or_default();

        let expected = if self.user == MD5_USER {
            let salt = [1u8, 2, 3, 4];
            let mut auth = BytesMut::new();
            auth.put_i32(5);
            auth.put_slice(&salt);
            self.message(b'R', &auth);

            let inner = format!("{:x}", md5::compute(format!("{}{}", PASSWORD, self.user)));
            let mut outer = inner.into_bytes();
            outer.extend_from_slice(&salt);
            format!("md5{:x}", md5::compute(&outer))
        } else {
            self.message(b'R', &3i32.to_be_bytes());
            PASSWORD.to_string()
        };
        self.flush().await?;

        let password = match self.read_message().await? {
            Some((b'p', mut body)) => cstr(&mut body),
            _ => return Ok(false),
        };
        if password != expected {
            let message = format!("password authentication failed for user \"{}\"", self.user);
            self.error("FATAL", "28P01", &message);
            self.flush().await?;
            return Ok(false);
        }

        self.message(b'R', &0i32.to_be_bytes());
        self.parameter_status("client_encoding", "UTF8");
        self.parameter_status("standard_conforming_strings", "on");
        self.parameter_status("server_version", "16.3");
        let mut key = BytesMut::new();
        key.put_i32(BACKEND_PID);
        key.put_i32(BACKEND_SECRET);
        self.message(b'K', &key);
        self.ready();
        self.flush().await?;

        Ok(true)
    }

    /// Returns `false` when the session must end.
    async fn simple_query(&mut self, sql: &str) -> io::Result<bool> {
        if sql.trim().is_empty() {
            self.message(b'I', &[]);
        }

        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let ok = match respond(statement, &[]) {
                Reply::CopyIn => self.copy_in().await?,
                Reply::Terminate => {
                    self.error(
                        "FATAL",
                        "57P01",
                        "terminating connection due to administrator command",
                    );
                    return Ok(false);
                }
                reply => self.reply(reply, true),
            };
            if !ok {
                break;
            }
        }

        self.ready();
        Ok(true)
    }

    fn parse(&mut self, mut body: Bytes) {
        let name = cstr(&mut body);
        let query = cstr(&mut body);
        let types = (0..body.get_i16()).map(|_| body.get_u32()).collect();
        self.shared.param_types.lock().push(types);

        if !name.is_empty() && self.statements.contains_key(&name) {
            self.fail("42P05", &format!("prepared statement \"{}\" already exists", name));
            return;
        }
        let dummy = vec![None; param_count(&query)];
        if let Reply::Error { code, message } = respond(&query, &dummy) {
            self.fail(code, &message);
            return;
        }

        self.statements.insert(name, query);
        self.message(b'1', &[]);
    }

    fn bind(&mut self, mut body: Bytes) {
        let _portal = cstr(&mut body);
        let statement = cstr(&mut body);

        let formats = body.get_i16() as usize;
        body.advance(formats * 2);
        let count = body.get_i16() as usize;
        let mut params = Vec::with_capacity(count);
        for _ in 0..count {
            let len = body.get_i32();
            if len < 0 {
                params.push(None);
            } else {
                let value = body.split_to(len as usize);
                params.push(Some(String::from_utf8_lossy(&value).into_owned()));
            }
        }

        match self.statements.get(&statement) {
            Some(query) => {
                self.portal = Some((query.clone(), params));
                self.message(b'2', &[]);
            }
            None => self.fail(
                "26000",
                &format!("prepared statement \"{}\" does not exist", statement),
            ),
        }
    }

    fn describe(&mut self, mut body: Bytes) {
        let kind = body.get_u8();
        let name = cstr(&mut body);

        let (query, params) = if kind == b'S' {
            let Some(query) = self.statements.get(&name).cloned() else {
                self.fail(
                    "26000",
                    &format!("prepared statement \"{}\" does not exist", name),
                );
                return;
            };
            let n = param_count(&query);
            let mut types = BytesMut::new();
            types.put_i16(n as i16);
            for _ in 0..n {
                types.put_u32(TEXT);
            }
            self.message(b't', &types);
            (query, vec![None; n])
        } else {
            match self.portal.clone() {
                Some(portal) => portal,
                None => {
                    self.fail("34000", "portal \"\" does not exist");
                    return;
                }
            }
        };

        match respond(&query, &params) {
            Reply::Rows { columns, .. } => self.row_description(&columns),
            _ => self.message(b'n', &[]),
        }
    }

    fn execute(&mut self) {
        let Some((query, params)) = self.portal.take() else {
            self.fail("34000", "portal \"\" does not exist");
            return;
        };
        let reply = respond(&query, &params);
        if !self.reply(reply, false) {
            self.failed = true;
        }
    }

    /// Write a reply. Returns `false` if it was an error.
    fn reply(&mut self, reply: Reply, describe: bool) -> bool {
        match reply {
            Reply::Rows { columns, rows } => {
                if describe {
                    self.row_description(&columns);
                }
                let tag = format!("SELECT {}", rows.len());
                for row in rows {
                    let mut body = BytesMut::new();
                    body.put_i16(row.len() as i16);
                    for value in row {
                        match value {
                            Some(v) => {
                                body.put_i32(v.len() as i32);
                                body.put_slice(v.as_bytes());
                            }
                            None => body.put_i32(-1),
                        }
                    }
                    self.message(b'D', &body);
                }
                self.complete(&tag);
            }
            Reply::Command(tag) => {
                match tag.as_str() {
                    "BEGIN" => self.status = b'T',
                    "COMMIT" | "ROLLBACK" => self.status = b'I',
                    _ => {}
                }
                self.complete(&tag);
            }
            Reply::Empty => self.message(b'I', &[]),
            Reply::Error { code, message } => {
                self.error("ERROR", code, &message);
                return false;
            }
            Reply::Notice => {
                let mut body = BytesMut::new();
                for (field, value) in [
                    (b'S', "NOTICE"),
                    (b'V', "NOTICE"),
                    (b'C', "00000"),
                    (b'M', "hello from the server"),
                ] {
                    body.put_u8(field);
                    put_cstr(&mut body, value);
                }
                body.put_u8(0);
                self.message(b'N', &body);
                self.complete("DO");
            }
            Reply::Listen(channel) => {
                self.complete("LISTEN");
                let mut body = BytesMut::new();
                body.put_i32(NOTIFY_PID);
                put_cstr(&mut body, &channel);
                put_cstr(&mut body, "hello");
                self.message(b'A', &body);
            }
            Reply::SetParameter(name, value) => {
                self.parameter_status(&name, &value);
                self.complete("SET");
            }
            Reply::CopyOut(lines) => {
                self.copy_response(b'H');
                for line in &lines {
                    self.message(b'd', line.as_bytes());
                }
                self.message(b'c', &[]);
                self.complete(&format!("COPY {}", lines.len()));
            }
            Reply::CopyIn | Reply::Terminate => {
                self.error("ERROR", "0A000", "not supported by the extended protocol");
                return false;
            }
        }
        true
    }

    async fn copy_in(&mut self) -> io::Result<bool> {
        self.copy_response(b'G');
        self.flush().await?;

        let mut lines = 0;
        while let Some((tag, mut body)) = self.read_message().await? {
            self.shared.frontend.lock().push(tag);
            match tag {
                b'd' => lines += body.iter().filter(|&&b| b == b'\n').count(),
                b'c' => {
                    self.complete(&format!("COPY {}", lines));
                    return Ok(true);
                }
                b'f' => {
                    let reason = cstr(&mut body);
                    self.error(
                        "ERROR",
                        "57014",
                        &format!("COPY from stdin failed: {}", reason),
                    );
                    return Ok(false);
                }
                _ => {}
            }
        }
        Ok(false)
    }

    // ========================================================================
    // Message writers
    // ========================================================================

    fn message(&mut self, tag: u8, body: &[u8]) {
        self.out.put_u8(tag);
        self.out.put_i32(body.len() as i32 + 4);
        self.out.put_slice(body);
    }

    fn ready(&mut self) {
        let status = self.status;
        self.message(b'Z', &[status]);
    }

    fn complete(&mut self, tag: &str) {
        let mut body = BytesMut::new();
        put_cstr(&mut body, tag);
        self.message(b'C', &body);
    }

    fn parameter_status(&mut self, name: &str, value: &str) {
        let mut body = BytesMut::new();
        put_cstr(&mut body, name);
        put_cstr(&mut body, value);
        self.message(b'S', &body);
    }

    fn row_description(&mut self, columns: &[Column]) {
        let mut body = BytesMut::new();
        body.put_i16(columns.len() as i16);
        for column in columns {
            put_cstr(&mut body, &column.name);
            body.put_u32(column.table_oid);
            body.put_i16(column.attr);
            body.put_u32(column.type_oid);
            body.put_i16(column.size);
            body.put_i32(-1);
            body.put_i16(0);
        }
        self.message(b'T', &body);
    }

    fn copy_response(&mut self, tag: u8) {
        let mut body = BytesMut::new();
        body.put_i8(0);
        body.put_i16(2);
        body.put_i16(0);
        body.put_i16(0);
        self.message(tag, &body);
    }

    fn error(&mut self, severity: &str, code: &str, message: &str) {
        if self.status == b'T' {
            self.status = b'E';
        }
        let mut body = BytesMut::new();
        for (field, value) in [
            (b'S', severity),
            (b'V', severity),
            (b'C', code),
            (b'M', message),
        ] {
            body.put_u8(field);
            put_cstr(&mut body, value);
        }
        body.put_u8(0);
        self.message(b'E', &body);
    }

    /// Error in the extended protocol: skip to the next Sync.
    fn fail(&mut self, code: &str, message: &str) {
        self.error("ERROR", code, message);
        self.failed = true;
    }

    async fn flush(&mut self) -> io::Result<()> {
        if !self.out.is_empty() {
            self.stream.write_all(&self.out).await?;
            self.out.clear();
        }
        Ok(())
    }

    async fn read_message(&mut self) -> io::Result<Option<(u8, Bytes)>> {
        let tag = match self.stream.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let len = self.stream.read_i32().await?;
        let mut body = vec![0u8; (len as usize).saturating_sub(4)];
        self.stream.read_exact(&mut body).await?;
        Ok(Some((tag, Bytes::from(body))))
    }
}
