//! File transfer to device storage over implicit FTPS.
//!
//! The device runs an FTP server wrapped in TLS from the first byte (port 990).
//! Data connections are protected too (`PROT P`), and their TLS sessions resume the
//! control session, which the shared client config provides.
//!
//! Uploads stream from disk in `chunk_size` pieces; nothing larger than one buffer
//! is ever held in memory. The protocol dialogue is generic over
//! [`TransferConnector`], so it runs the same over TLS sockets and in-memory pipes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::tokio_rustls::client::TlsStream;
use rumqttc::tokio_rustls::rustls::ClientConfig;
use rumqttc::tokio_rustls::TlsConnector;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::communication::tls::{device_client_config, server_name};
use crate::communication::transport::DeviceIdentity;
use crate::config::Config;
use crate::device::remote_file_name;
use crate::error::DeviceError;

/// Result of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    /// Absolute path in device storage, e.g. `/cache/cube.3mf`.
    pub remote_path: String,
    pub bytes_transferred: u64,
}

impl TransferReport {
    pub fn remote_name(&self) -> &str {
        self.remote_path.rsplit('/').next().unwrap_or(&self.remote_path)
    }
}

/// One server reply: status code plus the text of its final line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpReply {
    pub code: u16,
    pub text: String,
}

/// Split a reply line into `(code, is_final, text)`.
///
/// `"226 Transfer complete"` is final, `"211-Features:"` opens a multi-line reply.
/// Lines without a leading code (continuation text) yield `None`.
pub fn parse_reply_line(line: &str) -> Option<(u16, bool, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.len() < 3 || !line.is_char_boundary(3) {
        return None;
    }
    let code: u16 = line[..3].parse().ok()?;
    if !(100..600).contains(&code) {
        return None;
    }
    match line.as_bytes().get(3) {
        None => Some((code, true, "")),
        Some(b' ') => Some((code, true, &line[4..])),
        Some(b'-') => Some((code, false, &line[4..])),
        Some(_) => None,
    }
}

/// Data port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
///
/// The advertised host is ignored: devices behind NAT often report an internal
/// address, so the data connection always goes to the control host.
pub fn parse_pasv(text: &str) -> Option<u16> {
    let start = text.find('(')?;
    let end = text[start..].find(')')? + start;
    let fields: Vec<u16> = text[start + 1..end]
        .split(',')
        .map(|f| f.trim().parse::<u16>())
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() != 6 || fields.iter().any(|f| *f > 255) {
        return None;
    }
    Some(fields[4] * 256 + fields[5])
}

/// Opens the raw connections a transfer needs and wraps them in TLS.
///
/// Connecting and securing are separate steps because the data channel's
/// handshake may only start after the server accepted the transfer command.
#[async_trait]
pub trait TransferConnector: Send + Sync {
    type Raw: Send;
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn open(&self, port: u16) -> Result<Self::Raw, DeviceError>;
    async fn secure(&self, raw: Self::Raw) -> Result<Self::Stream, DeviceError>;
}

/// TCP plus TLS to the device, every connection under one client config.
#[derive(Clone)]
pub struct DeviceConnector {
    host: String,
    tls: Arc<ClientConfig>,
    io_timeout: Duration,
}

impl DeviceConnector {
    pub fn new(host: &str, tls: Arc<ClientConfig>, io_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            tls,
            io_timeout,
        }
    }

    /// The config every control and data connection is secured with.
    pub fn client_config(&self) -> &Arc<ClientConfig> {
        &self.tls
    }
}

#[async_trait]
impl TransferConnector for DeviceConnector {
    type Raw = TcpStream;
    type Stream = TlsStream<TcpStream>;

    async fn open(&self, port: u16) -> Result<TcpStream, DeviceError> {
        timed(self.io_timeout, TcpStream::connect((self.host.as_str(), port)))
            .await?
            .map_err(|e| DeviceError::Network(format!("{}:{}: {}", self.host, port, e)))
    }

    async fn secure(&self, raw: TcpStream) -> Result<TlsStream<TcpStream>, DeviceError> {
        let connector = TlsConnector::from(self.tls.clone());
        let name = server_name(&self.host)?;
        timed(self.io_timeout, connector.connect(name, raw))
            .await?
            .map_err(|e| DeviceError::Network(format!("TLS handshake with {}: {}", self.host, e)))
    }
}

/// Uploads, lists and deletes files in the device's storage directory.
pub struct FileTransfer<C = DeviceConnector> {
    connector: C,
    host: String,
    port: u16,
    principal: String,
    secret: String,
    remote_dir: String,
    max_upload_bytes: u64,
    chunk_size: usize,
    io_timeout: Duration,
}

impl FileTransfer {
    pub fn new(identity: &DeviceIdentity, config: &Config) -> Self {
        let connector = DeviceConnector::new(
            &identity.address,
            device_client_config(),
            config.transfer.io_timeout(),
        );
        Self::with_connector(connector, identity, config)
    }

    /// Reuse an existing client config so data channels can resume its sessions.
    pub fn with_tls_config(mut self, tls: Arc<ClientConfig>) -> Self {
        self.connector.tls = tls;
        self
    }
}

impl<C: TransferConnector> FileTransfer<C> {
    pub fn with_connector(connector: C, identity: &DeviceIdentity, config: &Config) -> Self {
        Self {
            connector,
            host: identity.address.clone(),
            port: config.printer.transfer_port,
            principal: config.printer.principal.clone(),
            secret: identity.access_secret.clone(),
            remote_dir: config.printer.remote_dir.trim_end_matches('/').to_string(),
            max_upload_bytes: config.transfer.max_upload_bytes,
            chunk_size: config.transfer.chunk_size.max(512),
            io_timeout: config.transfer.io_timeout(),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn remote_path(&self, remote_name: &str) -> String {
        format!("{}/{}", self.remote_dir, remote_name)
    }

    /// Checks that run before any network I/O: the file exists, is a regular
    /// file and fits under the upload limit. Returns its size.
    pub async fn preflight(&self, local: &Path) -> Result<u64, DeviceError> {
        let metadata = tokio::fs::metadata(local).await?;
        if !metadata.is_file() {
            return Err(DeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("'{}' is not a regular file", local.display()),
            )));
        }
        let size = metadata.len();
        if size > self.max_upload_bytes {
            return Err(DeviceError::Size {
                size,
                limit: self.max_upload_bytes,
            });
        }
        Ok(size)
    }

    /// Stream `local` to `{remote_dir}/{remote_name}`, overwriting any existing file.
    ///
    /// `remote_name` defaults to the local base name. A failure at any point leaves
    /// the remote file undefined; retrying with the same name overwrites it. Every
    /// chunk must be accepted within the I/O timeout, so a stalled device fails the
    /// upload instead of hanging it.
    pub async fn upload(
        &self,
        local: &Path,
        remote_name: Option<&str>,
    ) -> Result<TransferReport, DeviceError> {
        let size = self.preflight(local).await?;
        let remote_name = match remote_name {
            Some(name) => name.to_string(),
            None => remote_file_name(local)?,
        };
        let remote_path = self.remote_path(&remote_name);
        tracing::info!(
            "Uploading {} ({} bytes) to {}:{}",
            local.display(),
            size,
            self.host,
            remote_path
        );

        let mut control = self.login().await?;
        // Missing directory is created; "already exists" is not an error.
        if let Ok(reply) = control.command(&format!("MKD {}", self.remote_dir)).await {
            tracing::trace!("MKD {}: {} {}", self.remote_dir, reply.code, reply.text);
        }
        control.expect("TYPE I", &[200]).await?;

        let data_port = passive_port(&mut control).await?;
        let data = self.connector.open(data_port).await?;
        control.expect(&format!("STOR {}", remote_path), &[125, 150]).await?;
        let mut data = self.connector.secure(data).await?;

        let mut file = tokio::fs::File::open(local).await?;
        let mut chunk = vec![0u8; self.chunk_size];
        let mut bytes_transferred = 0u64;
        loop {
            let read = file.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            timed(self.io_timeout, data.write_all(&chunk[..read])).await??;
            bytes_transferred += read as u64;
        }
        timed(self.io_timeout, data.shutdown()).await??;
        drop(data);

        control.expect_reply(&[226, 250]).await?;
        control.quit().await;

        tracing::info!("Upload of {} finished: {} bytes", remote_path, bytes_transferred);
        Ok(TransferReport {
            remote_path,
            bytes_transferred,
        })
    }

    /// Names of the files in the storage directory.
    pub async fn list_files(&self) -> Result<Vec<String>, DeviceError> {
        let mut control = self.login().await?;
        control.expect("TYPE I", &[200]).await?;
        let data_port = passive_port(&mut control).await?;
        let data = self.connector.open(data_port).await?;
        control.expect(&format!("NLST {}", self.remote_dir), &[125, 150]).await?;
        let mut data = self.connector.secure(data).await?;

        let mut listing = String::new();
        timed(self.io_timeout, data.read_to_string(&mut listing)).await??;
        drop(data);
        control.expect_reply(&[226, 250]).await?;
        control.quit().await;

        Ok(listing
            .lines()
            .map(|line| line.trim().rsplit('/').next().unwrap_or("").to_string())
            .filter(|name| !name.is_empty())
            .collect())
    }

    pub async fn delete(&self, remote_name: &str) -> Result<(), DeviceError> {
        let mut control = self.login().await?;
        let path = self.remote_path(remote_name);
        control.expect(&format!("DELE {}", path), &[250]).await?;
        control.quit().await;
        tracing::info!("Deleted {}", path);
        Ok(())
    }

    async fn login(&self) -> Result<ControlConnection<C::Stream>, DeviceError> {
        let raw = self.connector.open(self.port).await?;
        let stream = self.connector.secure(raw).await?;
        let mut control = ControlConnection {
            stream: BufReader::new(stream),
            io_timeout: self.io_timeout,
        };
        control.expect_reply(&[220]).await?;

        let user = control.command(&format!("USER {}", self.principal)).await?;
        match user.code {
            230 => {}
            331 | 332 => {
                let pass = control.send_secret(&self.secret).await?;
                match pass.code {
                    230 | 202 => {}
                    530 => return Err(DeviceError::Auth(pass.text)),
                    code => {
                        return Err(DeviceError::Network(format!("PASS: {} {}", code, pass.text)))
                    }
                }
            }
            530 => return Err(DeviceError::Auth(user.text)),
            code => return Err(DeviceError::Network(format!("USER: {} {}", code, user.text))),
        }

        control.expect("PBSZ 0", &[200]).await?;
        control.expect("PROT P", &[200]).await?;
        tracing::debug!("Transfer channel ready on {}:{}", self.host, self.port);
        Ok(control)
    }
}

async fn passive_port<S>(control: &mut ControlConnection<S>) -> Result<u16, DeviceError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply = control.expect("PASV", &[227]).await?;
    parse_pasv(&reply.text)
        .ok_or_else(|| DeviceError::Network(format!("unparseable PASV reply: {}", reply.text)))
}

async fn timed<F: std::future::Future>(limit: Duration, fut: F) -> Result<F::Output, DeviceError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| DeviceError::Network(format!("transfer I/O timed out after {:?}", limit)))
}

struct ControlConnection<S> {
    stream: BufReader<S>,
    io_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ControlConnection<S> {
    async fn read_reply(&mut self) -> Result<FtpReply, DeviceError> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::time::timeout(self.io_timeout, self.stream.read_line(&mut line))
                .await
                .map_err(|_| DeviceError::Network("no reply from transfer server".to_string()))??;
            if read == 0 {
                return Err(DeviceError::Network("transfer server closed the connection".to_string()));
            }
            if let Some((code, true, text)) = parse_reply_line(&line) {
                return Ok(FtpReply {
                    code,
                    text: text.to_string(),
                });
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), DeviceError> {
        let stream = self.stream.get_mut();
        timed(self.io_timeout, async {
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
            stream.flush().await
        })
        .await??;
        Ok(())
    }

    async fn command(&mut self, line: &str) -> Result<FtpReply, DeviceError> {
        tracing::trace!("FTP > {}", line);
        self.write_line(line).await?;
        let reply = self.read_reply().await?;
        tracing::trace!("FTP < {} {}", reply.code, reply.text);
        Ok(reply)
    }

    async fn send_secret(&mut self, secret: &str) -> Result<FtpReply, DeviceError> {
        tracing::trace!("FTP > PASS ****");
        self.write_line(&format!("PASS {}", secret)).await?;
        self.read_reply().await
    }

    async fn expect(&mut self, line: &str, accepted: &[u16]) -> Result<FtpReply, DeviceError> {
        let reply = self.command(line).await?;
        check(line, reply, accepted)
    }

    async fn expect_reply(&mut self, accepted: &[u16]) -> Result<FtpReply, DeviceError> {
        let reply = self.read_reply().await?;
        check("reply", reply, accepted)
    }

    async fn quit(mut self) {
        let _ = self.command("QUIT").await;
        let _ = self.stream.get_mut().shutdown().await;
    }
}

fn check(what: &str, reply: FtpReply, accepted: &[u16]) -> Result<FtpReply, DeviceError> {
    if accepted.contains(&reply.code) {
        return Ok(reply);
    }
    let verb = what.split_whitespace().next().unwrap_or(what);
    match reply.code {
        530 => Err(DeviceError::Auth(reply.text)),
        // Local or remote storage problems.
        450 | 451 | 452 | 550 | 552 | 553 => Err(DeviceError::Io(std::io::Error::other(format!(
            "{}: {} {}",
            verb, reply.code, reply.text
        )))),
        code => Err(DeviceError::Network(format!("{}: {} {}", verb, code, reply.text))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;
    use tokio::io::{duplex, DuplexStream};

    type Log = Arc<Mutex<Vec<String>>>;

    /// Hands out pre-built in-memory pipes in connection order.
    struct PipeConnector {
        pipes: Mutex<VecDeque<DuplexStream>>,
        log: Log,
    }

    #[async_trait]
    impl TransferConnector for PipeConnector {
        type Raw = DuplexStream;
        type Stream = DuplexStream;

        async fn open(&self, port: u16) -> Result<DuplexStream, DeviceError> {
            self.log.lock().unwrap().push(format!("open:{}", port));
            self.pipes
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| DeviceError::Network("connection refused".into()))
        }

        async fn secure(&self, raw: DuplexStream) -> Result<DuplexStream, DeviceError> {
            Ok(raw)
        }
    }

    /// How the scripted server answers.
    #[derive(Clone, Copy)]
    struct Script {
        pass: &'static str,
        after_data: &'static str,
        stall_data: bool,
        listing: &'static str,
    }

    impl Default for Script {
        fn default() -> Self {
            Self {
                pass: "230 logged in",
                after_data: "226 transfer complete",
                stall_data: false,
                listing: "/cache/a.3mf\r\n/cache/b.stl\r\n",
            }
        }
    }

    async fn serve(control: DuplexStream, mut data: Option<DuplexStream>, script: Script, log: Log) {
        let (read, mut write) = tokio::io::split(control);
        let mut lines = BufReader::new(read).lines();
        write.write_all(b"220 ready\r\n").await.unwrap();
        while let Ok(Some(line)) = lines.next_line().await {
            log.lock().unwrap().push(format!("> {}", line));
            let verb = line.split_whitespace().next().unwrap_or("").to_string();
            let reply = match verb.as_str() {
                "USER" => "331 password required",
                "PASS" => script.pass,
                "PBSZ" | "PROT" | "TYPE" => "200 ok",
                "MKD" => "550 already exists",
                "PASV" => "227 Entering Passive Mode (10,0,0,1,195,80)",
                "STOR" => {
                    write.write_all(b"150 opening\r\n").await.unwrap();
                    let mut channel = data.take().unwrap();
                    if script.stall_data {
                        std::future::pending::<()>().await;
                    }
                    let mut received = Vec::new();
                    channel.read_to_end(&mut received).await.unwrap();
                    log.lock().unwrap().push(format!("received {} bytes", received.len()));
                    script.after_data
                }
                "NLST" => {
                    write.write_all(b"150 opening\r\n").await.unwrap();
                    let mut channel = data.take().unwrap();
                    channel.write_all(script.listing.as_bytes()).await.unwrap();
                    channel.shutdown().await.unwrap();
                    "226 done"
                }
                "DELE" => "250 deleted",
                "QUIT" => {
                    write.write_all(b"221 bye\r\n").await.unwrap();
                    break;
                }
                _ => "502 not implemented",
            };
            write.write_all(format!("{}\r\n", reply).as_bytes()).await.unwrap();
        }
    }

    fn config(max_upload_bytes: u64) -> Config {
        let mut config = Config::default();
        config.transfer.max_upload_bytes = max_upload_bytes;
        config.transfer.io_timeout_secs = 1;
        config.transfer.chunk_size = 512;
        config
    }

    /// A transfer wired to a scripted server; `data_capacity` bounds the data pipe.
    fn scripted(script: Script, data_capacity: usize) -> (FileTransfer<PipeConnector>, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let (control_client, control_server) = duplex(4096);
        let (data_client, data_server) = duplex(data_capacity);
        tokio::spawn(serve(control_server, Some(data_server), script, log.clone()));
        let connector = PipeConnector {
            pipes: Mutex::new(VecDeque::from([control_client, data_client])),
            log: log.clone(),
        };
        let identity = DeviceIdentity::new("10.0.0.1", "code", "SN");
        (FileTransfer::with_connector(connector, &identity, &config(1 << 20)), log)
    }

    fn model_file(len: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![b'x'; len]).unwrap();
        file.flush().unwrap();
        file
    }

    fn transfer(max_upload_bytes: u64) -> FileTransfer {
        let mut config = config(max_upload_bytes);
        // Nothing listens here; preflight failures must happen before any connect.
        config.printer.transfer_port = 9;
        FileTransfer::new(&DeviceIdentity::new("127.0.0.1", "code", "SN"), &config)
    }

    #[test]
    fn test_parse_reply_line() {
        assert_eq!(parse_reply_line("226 Transfer complete\r\n"), Some((226, true, "Transfer complete")));
        assert_eq!(parse_reply_line("211-Features:"), Some((211, false, "Features:")));
        assert_eq!(parse_reply_line("200"), Some((200, true, "")));
        assert_eq!(parse_reply_line(" UTF8"), None);
        assert_eq!(parse_reply_line("abc def"), None);
        assert_eq!(parse_reply_line("999 nope"), None);
    }

    #[test]
    fn test_parse_pasv() {
        assert_eq!(parse_pasv("Entering Passive Mode (192,168,1,50,195,80)."), Some(50_000));
        assert_eq!(parse_pasv("Entering Passive Mode (10,0,0,1,0,21)"), Some(21));
        assert_eq!(parse_pasv("Entering Passive Mode"), None);
        assert_eq!(parse_pasv("(1,2,3,4,5)"), None);
        assert_eq!(parse_pasv("(1,2,3,4,300,1)"), None);
    }

    #[test]
    fn test_unexpected_codes_map_to_error_kinds() {
        let reply = |code| FtpReply { code, text: "x".into() };
        assert!(matches!(check("PASS", reply(530), &[230]), Err(DeviceError::Auth(_))));
        assert!(matches!(check("STOR /cache/a", reply(552), &[150]), Err(DeviceError::Io(_))));
        assert!(matches!(check("PASV", reply(421), &[227]), Err(DeviceError::Network(_))));
        assert!(check("TYPE I", reply(200), &[200]).is_ok());
    }

    #[test]
    fn test_remote_path_uses_storage_dir() {
        let transfer = transfer(1024);
        assert_eq!(transfer.remote_path("cube.3mf"), "/cache/cube.3mf");
        let report = TransferReport {
            remote_path: "/cache/cube.3mf".into(),
            bytes_transferred: 3,
        };
        assert_eq!(report.remote_name(), "cube.3mf");
    }

    #[tokio::test]
    async fn test_missing_file_fails_before_network() {
        let err = transfer(1024)
            .upload(Path::new("/definitely/not/here.stl"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Io(_)));
    }

    #[tokio::test]
    async fn test_oversized_file_fails_before_network() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 2048]).unwrap();
        let err = transfer(1024).upload(file.path(), Some("big.stl")).await.unwrap_err();
        assert!(matches!(err, DeviceError::Size { size: 2048, limit: 1024 }));
    }

    #[tokio::test]
    async fn test_preflight_reports_size() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"solid cube\nendsolid cube\n").unwrap();
        assert_eq!(transfer(1024).preflight(file.path()).await.unwrap(), 25);
    }

    #[test]
    fn test_control_and_data_channels_share_one_tls_config() {
        let shared = device_client_config();
        let transfer = transfer(1024).with_tls_config(shared.clone());
        assert!(Arc::ptr_eq(transfer.connector().client_config(), &shared));
        // One for `shared`, one held by the connector.
        assert_eq!(Arc::strong_count(&shared), 2);
    }

    #[tokio::test]
    async fn test_upload_dialogue_opens_data_before_stor() {
        let (transfer, log) = scripted(Script::default(), 4096);
        let file = model_file(1500);

        let report = transfer.upload(file.path(), Some("cube.stl")).await.unwrap();
        assert_eq!(report.remote_path, "/cache/cube.stl");
        assert_eq!(report.bytes_transferred, 1500);

        let log = log.lock().unwrap().clone();
        let position = |entry: &str| log.iter().position(|line| line == entry).unwrap();
        assert_eq!(log[0], "open:990");
        assert!(position("> USER bblp") < position("> PASS code"));
        assert!(position("> PROT P") < position("> PASV"));
        // The advertised PASV host is ignored; only the port is used.
        assert!(position("open:50000") < position("> STOR /cache/cube.stl"));
        assert!(position("> STOR /cache/cube.stl") < position("received 1500 bytes"));
        assert_eq!(log.last().unwrap(), "> QUIT");
    }

    #[tokio::test]
    async fn test_rejected_credentials_map_to_auth() {
        let script = Script {
            pass: "530 Login incorrect",
            ..Script::default()
        };
        let (transfer, log) = scripted(script, 4096);
        let file = model_file(10);

        let err = transfer.upload(file.path(), None).await.unwrap_err();
        assert!(matches!(err, DeviceError::Auth(ref text) if text == "Login incorrect"));
        assert!(!log.lock().unwrap().iter().any(|line| line.starts_with("> STOR")));
    }

    #[tokio::test]
    async fn test_storage_failure_after_data_maps_to_io() {
        let script = Script {
            after_data: "451 Local error in processing",
            ..Script::default()
        };
        let (transfer, _log) = scripted(script, 4096);
        let file = model_file(700);

        let err = transfer.upload(file.path(), Some("cube.stl")).await.unwrap_err();
        assert!(matches!(err, DeviceError::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_data_channel_times_out() {
        let script = Script {
            stall_data: true,
            ..Script::default()
        };
        let (transfer, _log) = scripted(script, 64);
        let file = model_file(4096);

        let started = tokio::time::Instant::now();
        let err = transfer.upload(file.path(), Some("cube.stl")).await.unwrap_err();
        assert!(matches!(err, DeviceError::Network(ref text) if text.contains("timed out")));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_list_files_strips_directory() {
        let (transfer, log) = scripted(Script::default(), 4096);
        assert_eq!(transfer.list_files().await.unwrap(), vec!["a.3mf", "b.stl"]);
        assert!(log.lock().unwrap().contains(&"> NLST /cache".to_string()));
    }
}
