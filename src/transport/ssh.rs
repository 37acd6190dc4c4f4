//! SSH 传输
//!
//! 每个连接池槽位持有一个已认证的 SSH 客户端，每次请求打开一条 `direct-tcpip` 通道。
//! 服务端支持密码或 authorized_keys 公钥认证，两者都未配置时允许免认证登录。

use super::pool::{ConnPool, PoolSession};
use super::tcp::{accept_keepalive, bind, TcpDialer};
use super::{Accepted, TransportError};
use crate::protocol::BoxStream;
use async_trait::async_trait;
use russh::server::{Auth, Msg, Session};
use russh::{client, server, Channel, Disconnect, MethodSet};
use russh_keys::key::{KeyPair, PublicKey};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshOptions {
    pub user: String,
    pub password: String,
    /// 客户端：登录使用的私钥；服务端：主机私钥
    pub private_key: String,
    /// 客户端：启用公钥认证
    pub public_key: bool,
    /// 服务端：authorized_keys 文件
    pub authorized_key: String,
    pub conns: usize,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            password: String::new(),
            private_key: String::new(),
            public_key: false,
            authorized_key: String::new(),
            conns: 3,
        }
    }
}

fn ssh_error(e: russh::Error) -> io::Error {
    match e {
        russh::Error::IO(e) => e,
        e => io::Error::new(io::ErrorKind::Other, format!("ssh: {}", e)),
    }
}

fn load_key_pair(path: &str) -> Result<KeyPair, TransportError> {
    russh_keys::load_secret_key(path, None)
        .map_err(|e| TransportError::InvalidOption(format!("ssh private key {}: {}", path, e)))
}

/// 解析 authorized_keys，忽略无法识别的行
pub fn parse_authorized_keys(content: &str) -> Vec<PublicKey> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _algo = fields.next()?;
            russh_keys::parse_public_key_base64(fields.next()?).ok()
        })
        .collect()
}

/// 客户端回调，不校验主机公钥
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// 池中的一个 SSH 客户端
#[derive(Clone)]
pub struct SshSession {
    handle: Arc<client::Handle<ClientHandler>>,
}

impl PoolSession for SshSession {
    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    fn close(&self) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
        });
    }
}

pub struct SshDialer {
    opts: SshOptions,
    tcp: TcpDialer,
    key: Option<Arc<KeyPair>>,
    config: Arc<client::Config>,
    pool: ConnPool<SshSession>,
}

impl SshDialer {
    pub fn new(opts: SshOptions, tcp: TcpDialer) -> Result<Self, TransportError> {
        let key = if opts.public_key {
            Some(Arc::new(load_key_pair(&opts.private_key)?))
        } else {
            None
        };
        if key.is_none() && opts.password.is_empty() {
            debug!("ssh client configured without credentials, trying none auth");
        }
        let config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        });
        let pool = ConnPool::new(opts.conns);
        Ok(Self {
            opts,
            tcp,
            key,
            config,
            pool,
        })
    }

    pub async fn dial(&self, addr: &str) -> io::Result<BoxStream> {
        self.pool
            .open(|| self.dial_session(addr), |session| async move { self.open_channel(&session).await })
            .await
    }

    async fn dial_session(&self, addr: &str) -> io::Result<SshSession> {
        let stream = self.tcp.connect(addr).await?;
        let connect = async {
            let mut handle = client::connect_stream(self.config.clone(), stream, ClientHandler)
                .await
                .map_err(ssh_error)?;
            let user = self.opts.user.clone();
            let result = if let Some(key) = &self.key {
                handle.authenticate_publickey(user, key.clone()).await
            } else if !self.opts.password.is_empty() {
                handle.authenticate_password(user, self.opts.password.clone()).await
            } else {
                handle.authenticate_none(user).await
            };
            if !result.map_err(ssh_error)? {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "ssh authentication failed",
                ));
            }
            Ok(handle)
        };
        let handle = tokio::time::timeout(AUTH_TIMEOUT, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "ssh handshake timed out"))??;
        debug!("ssh session established with {}", addr);
        Ok(SshSession {
            handle: Arc::new(handle),
        })
    }

    async fn open_channel(&self, session: &SshSession) -> io::Result<BoxStream> {
        let channel = session
            .handle
            .channel_open_direct_tcpip("127.0.0.1", 0, "127.0.0.1", 0)
            .await
            .map_err(ssh_error)?;
        Ok(Box::new(channel.into_stream()))
    }

    pub async fn close(&self) {
        self.pool.close_all().await;
    }
}

/// 服务端每个连接的回调
struct ServerHandler {
    opts: Arc<SshOptions>,
    authorized: Arc<Vec<PublicKey>>,
    peer: SocketAddr,
    tx: mpsc::Sender<Accepted>,
}

impl ServerHandler {
    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }
}

#[async_trait]
impl server::Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        if self.opts.password.is_empty() && self.opts.authorized_key.is_empty() {
            return Ok(Auth::Accept);
        }
        Ok(Self::reject())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if !self.opts.password.is_empty() && user == self.opts.user && password == self.opts.password {
            return Ok(Auth::Accept);
        }
        warn!(user = %user, "ssh password authentication from {} failed", self.peer);
        Ok(Self::reject())
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint();
        if user == self.opts.user && self.authorized.iter().any(|k| k.fingerprint() == fingerprint) {
            return Ok(Auth::Accept);
        }
        warn!(user = %user, "ssh public key authentication from {} failed", self.peer);
        Ok(Self::reject())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let tx = self.tx.clone();
        let peer = self.peer;
        tokio::spawn(async move {
            let _ = tx.send((Box::new(channel.into_stream()) as BoxStream, peer)).await;
        });
        Ok(true)
    }
}

fn server_config(opts: &SshOptions) -> Result<server::Config, TransportError> {
    if opts.private_key.is_empty() {
        return Err(TransportError::InvalidOption(
            "ssh server requires private_key".to_string(),
        ));
    }
    let mut methods = MethodSet::empty();
    if !opts.password.is_empty() {
        methods |= MethodSet::PASSWORD;
    } else if !opts.authorized_key.is_empty() {
        methods |= MethodSet::PUBLICKEY;
    } else {
        methods |= MethodSet::NONE;
    }
    Ok(server::Config {
        keys: vec![load_key_pair(&opts.private_key)?],
        methods,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    })
}

pub async fn listen(
    addr: &str,
    opts: SshOptions,
    tx: mpsc::Sender<Accepted>,
    token: CancellationToken,
) -> Result<SocketAddr, TransportError> {
    let config = Arc::new(server_config(&opts)?);
    let authorized = if opts.password.is_empty() && !opts.authorized_key.is_empty() {
        let content = std::fs::read_to_string(&opts.authorized_key)?;
        let keys = parse_authorized_keys(&content);
        if keys.is_empty() {
            return Err(TransportError::InvalidOption(format!(
                "no public key found in {}",
                opts.authorized_key
            )));
        }
        keys
    } else {
        Vec::new()
    };
    let authorized = Arc::new(authorized);
    let opts = Arc::new(opts);

    let listener = bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(user = %opts.user, "SSH server listening on {}", local_addr);
    tokio::spawn(async move {
        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                r = accept_keepalive(&listener) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("accept failed: {}", e);
                        continue;
                    }
                }
            };
            let handler = ServerHandler {
                opts: opts.clone(),
                authorized: authorized.clone(),
                peer,
                tx: tx.clone(),
            };
            let config = config.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let session = match server::run_stream(config, stream, handler).await {
                    Ok(session) => session,
                    Err(e) => {
                        debug!("ssh handshake with {} failed: {}", peer, e);
                        return;
                    }
                };
                tokio::select! {
                    r = session => {
                        if let Err(e) = r {
                            debug!("ssh session with {} ended: {}", peer, e);
                        }
                    }
                    _ = token.cancelled() => {}
                }
            });
        }
    });
    Ok(local_addr)
}
