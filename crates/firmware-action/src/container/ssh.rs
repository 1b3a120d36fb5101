//! Exposes a failed build container over SSH for post-mortem inspection.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::process::{Command, Stdio};
use std::sync::mpsc::{Receiver, SyncSender};

use rand::Rng;
use rand::distributions::Alphanumeric;

use super::Container;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;

pub const PASSWORD_LEN: usize = 16;
const SSH_PORT: u16 = 22;

/// Where to connect once the service is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshInfo {
    pub addr: IpAddr,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl fmt::Display for SshInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ssh -p {} {}@{} (password: {})",
            self.port, self.user, self.addr, self.password
        )
    }
}

/// Parses `host:port`; an empty port means 22.
pub fn parse_address(s: &str) -> Result<(IpAddr, u16)> {
    let s = s.trim();
    let (host, port) = match s.rsplit_once(':') {
        // A bare IPv6 address has colons but no brackets.
        Some(_) if !s.starts_with('[') && s.matches(':').count() > 1 => (s, ""),
        Some((h, p)) => (h, p),
        None => (s, ""),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::new(
            ErrorKind::ParseAddress,
            format!("'{s}' has no host part"),
        ));
    }
    let addr: IpAddr = host
        .parse()
        .map_err(|e| Error::new(ErrorKind::ParseAddress, format!("'{s}': {e}")))?;
    let port = if port.is_empty() {
        SSH_PORT
    } else {
        port.parse()
            .map_err(|e| Error::new(ErrorKind::ParseAddress, format!("'{s}': bad port: {e}")))?
    };
    Ok((addr, port))
}

pub fn generate_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

struct ServiceGuard<'a> {
    engine: &'a str,
    name: String,
    image: String,
}

impl Drop for ServiceGuard<'_> {
    fn drop(&mut self) {
        for args in [
            vec!["rm", "-f", self.name.as_str()],
            vec!["rmi", "-f", self.image.as_str()],
        ] {
            let _ = Command::new(self.engine)
                .args(&args)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }
}

/// Serves `container` until `teardown` fires (or its sender goes away).
///
/// Connection details, or the reason the service could not start, are sent
/// once on `ready`.
pub fn serve(
    ctx: &ExecCtx,
    container: &Container,
    ready: SyncSender<Result<SshInfo>>,
    teardown: Receiver<()>,
) -> Result<()> {
    let guard = ServiceGuard {
        engine: container.engine(),
        name: format!("{}-ssh", container.name()),
        image: format!("firmware-action-debug/{}:latest", container.name()),
    };

    match start(ctx, container, &guard) {
        Ok(info) => {
            tracing::info!(container = %guard.name, "ssh service ready on port {}", info.port);
            let _ = ready.send(Ok(info));
        }
        Err(e) => {
            let text = e.to_string();
            let _ = ready.send(Err(e));
            return Err(Error::msg(format!("ssh service failed to start: {text}")));
        }
    }

    let _ = teardown.recv();
    tracing::info!(container = %guard.name, "ssh service stopped");
    Ok(())
}

fn start(ctx: &ExecCtx, container: &Container, guard: &ServiceGuard<'_>) -> Result<SshInfo> {
    container.commit(ctx, &guard.image)?;

    let password = generate_password(PASSWORD_LEN);
    let script = format!(
        "echo 'root:{password}' | chpasswd && mkdir -p /run/sshd && \
         (ssh-keygen -A >/dev/null 2>&1 || true) && \
         exec /usr/sbin/sshd -D -e -o PermitRootLogin=yes -o PasswordAuthentication=yes"
    );
    let mut run = Command::new(guard.engine);
    run.args(["run", "-d", "--name", &guard.name])
        .args(["-p", &SSH_PORT.to_string()])
        .args(["--workdir", container.workdir()])
        .args(["--entrypoint", "bash"])
        .arg(&guard.image)
        .args(["-c", &script]);
    ctx.run_capture(run)?;

    let mut port = Command::new(guard.engine);
    port.args(["port", &guard.name, &format!("{SSH_PORT}/tcp")]);
    let out = ctx.run_capture(port)?;
    let first = out
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| Error::new(ErrorKind::ParseAddress, "engine reported no published port"))?;
    let (mut addr, port) = parse_address(first)?;
    if addr.is_unspecified() {
        addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    }

    Ok(SshInfo {
        addr,
        port,
        user: "root".into(),
        password,
    })
}
