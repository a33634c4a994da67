// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The namespace assembler
//!
//! Runs once per session: authenticate, mount the remote tree, then apply
//! bind overlays. Overlay failures are collected and reported as a warning
//! instead of aborting the session.

use std::fs;
use std::io;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use cpufs_core::{Client, DuplexStream, Nonce};
use cpufs_gateway::{default_mounter, Gateway, GatewayMounter, MountedGateway};
use nix::mount::MsFlags;
use tracing::{debug, info, info_span, warn, Span};

use crate::bind::parse_binds;
use crate::config::{Environment, ServeMode, SessionConfig, NONCE_ENV};
use crate::error::{OverlayWarning, SessionError};
use crate::mounter::Mounter;

/// Opens the connection back to the 9P server.
pub trait Connector {
    type Stream: DuplexStream + AsRawFd;

    fn connect(&self) -> io::Result<Self::Stream>;
}

/// Dials the 9P port on localhost.
pub struct TcpConnector {
    pub port: String,
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect(("localhost", self.port.parse::<u16>().map_err(invalid_port)?))
    }
}

fn invalid_port(e: std::num::ParseIntError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("bad 9p port: {e}"))
}

pub struct Namespace<C: Connector> {
    config: SessionConfig,
    connector: C,
    env: Box<dyn Environment>,
    mounter: Box<dyn Mounter>,
    gateway_mounter: Box<dyn GatewayMounter>,
    gateway: Option<Box<dyn MountedGateway>>,
    failed: bool,
    span: Span,
}

impl<C: Connector> Namespace<C> {
    pub fn new(
        config: SessionConfig,
        connector: C,
        env: Box<dyn Environment>,
        mounter: Box<dyn Mounter>,
    ) -> Self {
        let span = info_span!("namespace", mode = ?config.mode);
        Self {
            config,
            connector,
            env,
            mounter,
            gateway_mounter: default_mounter(),
            gateway: None,
            failed: false,
            span,
        }
    }

    pub fn with_gateway_mounter(mut self, mounter: Box<dyn GatewayMounter>) -> Self {
        self.gateway_mounter = mounter;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// True once any bind overlay has failed.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Whether a gateway mount is being served by this session.
    pub fn has_gateway(&self) -> bool {
        self.gateway.is_some()
    }

    /// Block until the gateway mount, if any, goes away.
    pub fn wait(&mut self) {
        if let Some(mounted) = self.gateway.take() {
            mounted.join();
        }
    }

    /// Assemble the namespace.
    ///
    /// Returns `Ok(None)` without touching anything when there is no
    /// session secret or nothing to bind. The secret stays in the
    /// environment on those paths and on a malformed bind list.
    pub fn assemble(&mut self) -> Result<Option<OverlayWarning>, SessionError> {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.env.get(NONCE_ENV).is_none() {
            debug!("no session secret; leaving the namespace alone");
            return Ok(None);
        }
        let binds = parse_binds(&self.config.namespace)?;
        if binds.is_empty() {
            debug!("no binds requested");
            return Ok(None);
        }
        let Some(secret) = self.env.take(NONCE_ENV) else {
            return Ok(None);
        };
        let nonce = Nonce::from(secret);

        let mut warning = OverlayWarning::default();
        self.prepare_tmp(&mut warning)?;

        let mut stream = self
            .connector
            .connect()
            .map_err(|e| SessionError::transport("Dial 9p port", e))?;
        nonce.write_to(&mut stream).map_err(|e| SessionError::transport("Write nonce", e))?;
        drop(nonce);
        debug!("session authenticated");

        let target = self.config.mount_target();
        match self.config.mode {
            ServeMode::KernelNative => self.mount_native(stream, &target)?,
            ServeMode::Gateway => self.mount_gateway(stream, &target)?,
        }

        for bind in &binds {
            let source = target.join(bind.remote.trim_start_matches('/'));
            let local = Path::new(&bind.local);
            match self.mounter.mount(&source.to_string_lossy(), local, "", MsFlags::MS_BIND, "") {
                Ok(()) => debug!(source = %source.display(), local = %bind.local, "bound"),
                Err(e) => {
                    let failure = format!(
                        "CPUD:Warning: mounting {} on {} failed: {}",
                        source.display(),
                        bind,
                        e
                    );
                    self.soft_failure(&mut warning, failure);
                }
            }
        }
        Ok((!warning.is_empty()).then_some(warning))
    }

    fn soft_failure(&mut self, warning: &mut OverlayWarning, failure: String) {
        self.failed = true;
        warn!("{failure}");
        warning.push(failure);
    }

    /// Put a private tmpfs on the temporary mount directory, create the
    /// mount target inside it, and bind the original root onto `local`.
    fn prepare_tmp(&mut self, warning: &mut OverlayWarning) -> Result<(), SessionError> {
        let tmp = self.config.tmp_mnt.clone();
        fs::create_dir_all(&tmp).map_err(|e| SessionError::transport("Create tmp mount", e))?;
        self.mounter
            .mount("cpu", &tmp, "tmpfs", MsFlags::empty(), "")
            .map_err(|e| SessionError::transport("tmpfs mount", e))?;
        fs::create_dir_all(self.config.mount_target())
            .map_err(|e| SessionError::transport("Create mount target", e))?;
        debug!(tmp = %tmp.display(), "tmpfs mounted");

        let local = tmp.join("local");
        let bound = fs::create_dir_all(&local)
            .and_then(|()| self.mounter.mount("/", &local, "", MsFlags::MS_BIND, ""));
        if let Err(e) = bound {
            let failure = format!(
                "CPUD:Warning: binding / over {} did not work: {}, continuing anyway",
                local.display(),
                e
            );
            self.soft_failure(warning, failure);
        }
        Ok(())
    }

    fn mount_native(&self, stream: C::Stream, target: &Path) -> Result<(), SessionError> {
        let fd = stream.as_raw_fd();
        let mut data = format!(
            "version=9p2000.L,trans=fd,rfdno={fd},wfdno={fd},uname={},debug=0,msize={}",
            self.config.user, self.config.msize
        );
        if let Some(extra) = self.config.mount_options.as_deref().filter(|o| !o.is_empty()) {
            data.push(',');
            data.push_str(extra);
        }
        let flags = MsFlags::MS_NODEV | MsFlags::MS_NOSUID;
        debug!(target = %target.display(), %data, "mounting 9p");
        self.mounter
            .mount("localhost", target, "9p", flags, &data)
            .map_err(|e| SessionError::transport("9p mount", e))?;
        // The kernel holds its own reference to the socket now.
        drop(stream);
        info!(target = %target.display(), "9p mounted");
        Ok(())
    }

    fn mount_gateway(&mut self, stream: C::Stream, target: &Path) -> Result<(), SessionError> {
        let client = Client::connect_with_span(stream, self.config.gateway_msize, self.span.clone())
            .map_err(|e| SessionError::transport("9p version", e))?;
        let (_, root) = client
            .attach(&self.config.user, "/")
            .map_err(|e| SessionError::transport("9p attach", e))?;
        let gateway = Gateway::new(Box::new(root), self.config.gateway_config())
            .map_err(|e| SessionError::transport("gateway", e))?
            .with_span(self.span.clone());
        let mounted = self
            .gateway_mounter
            .mount(Arc::new(gateway), target)
            .map_err(|e| SessionError::transport("FUSE mount", e))?;
        info!(target = %target.display(), "gateway mounted");
        self.gateway = Some(mounted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockEnvironment;
    use crate::mounter::MockMounter;
    use cpufs_core::testing::sample_archive;
    use cpufs_core::{ArchiveFs, Server};
    use cpufs_gateway::ROOT_INODE;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;
    use std::thread;
    use tempfile::TempDir;

    /// Hands out one prepared stream.
    struct PairConnector(Mutex<Option<UnixStream>>);

    impl PairConnector {
        fn new(stream: UnixStream) -> Self {
            Self(Mutex::new(Some(stream)))
        }
    }

    impl Connector for PairConnector {
        type Stream = UnixStream;

        fn connect(&self) -> io::Result<UnixStream> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "used"))
        }
    }

    struct Refused;

    impl Connector for Refused {
        type Stream = UnixStream;

        fn connect(&self) -> io::Result<UnixStream> {
            Err(io::ErrorKind::ConnectionRefused.into())
        }
    }

    /// An environment holding `nonce`; `taken` says whether assembly is
    /// expected to consume it.
    fn env_with_nonce(nonce: Option<&'static str>, taken: bool) -> Box<MockEnvironment> {
        let mut env = MockEnvironment::new();
        env.expect_get()
            .withf(|key| key == NONCE_ENV)
            .times(1)
            .returning(move |_| nonce.map(str::to_string));
        env.expect_take()
            .withf(|key| key == NONCE_ENV)
            .times(usize::from(taken))
            .returning(move |_| nonce.map(str::to_string));
        Box::new(env)
    }

    fn config(tmp: &TempDir, namespace: &str) -> SessionConfig {
        SessionConfig {
            namespace: namespace.to_string(),
            user: "glenda".to_string(),
            tmp_mnt: tmp.path().to_path_buf(),
            ..Default::default()
        }
    }

    fn expect_setup(mounter: &mut MockMounter, tmp: &Path) {
        let tmpfs_on = tmp.to_path_buf();
        mounter
            .expect_mount()
            .withf(move |source, target, fstype, flags, _| {
                source == "cpu" && target == tmpfs_on && fstype == "tmpfs" && flags.is_empty()
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        let local = tmp.join("local");
        mounter
            .expect_mount()
            .withf(move |source, target, _, flags, _| {
                source == "/" && target == local && *flags == MsFlags::MS_BIND
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
    }

    #[test]
    fn no_secret_means_no_namespace() {
        let tmp = TempDir::new().unwrap();
        let mut mounter = MockMounter::new();
        mounter.expect_mount().never();
        let mut ns = Namespace::new(
            config(&tmp, "/bin"),
            Refused,
            env_with_nonce(None, false),
            Box::new(mounter),
        );
        assert!(ns.assemble().unwrap().is_none());
        assert!(!ns.failed());
        assert!(!tmp.path().join("cpu").exists());
    }

    #[test]
    fn no_binds_leaves_the_secret_in_place() {
        let tmp = TempDir::new().unwrap();
        let mut mounter = MockMounter::new();
        mounter.expect_mount().never();
        let mut ns = Namespace::new(
            config(&tmp, ""),
            Refused,
            env_with_nonce(Some("n"), false),
            Box::new(mounter),
        );
        assert!(ns.assemble().unwrap().is_none());
    }

    #[test]
    fn malformed_namespace_is_reported_before_the_secret_is_taken() {
        let tmp = TempDir::new().unwrap();
        let mut mounter = MockMounter::new();
        mounter.expect_mount().never();
        let mut ns = Namespace::new(
            config(&tmp, "/bin::/lib"),
            Refused,
            env_with_nonce(Some("n"), false),
            Box::new(mounter),
        );
        assert!(matches!(ns.assemble(), Err(SessionError::Bind(_))));
    }

    #[test]
    fn setup_creates_the_mount_target_before_dialing() {
        let tmp = TempDir::new().unwrap();
        let mut mounter = MockMounter::new();
        expect_setup(&mut mounter, tmp.path());
        let mut ns = Namespace::new(
            config(&tmp, "/bin"),
            Refused,
            env_with_nonce(Some("n"), true),
            Box::new(mounter),
        );
        let err = ns.assemble().unwrap_err();
        assert!(err.to_string().starts_with("CPUD:Dial 9p port"), "{err}");
        assert!(tmp.path().join("cpu").is_dir());
        assert!(tmp.path().join("local").is_dir());
    }

    #[test]
    fn tmpfs_failure_is_hard() {
        let tmp = TempDir::new().unwrap();
        let mut mounter = MockMounter::new();
        mounter
            .expect_mount()
            .withf(|_, _, fstype, _, _| fstype == "tmpfs")
            .times(1)
            .returning(|_, _, _, _, _| Err(io::Error::from_raw_os_error(libc::EPERM)));
        let mut ns = Namespace::new(
            config(&tmp, "/bin"),
            Refused,
            env_with_nonce(Some("n"), true),
            Box::new(mounter),
        );
        let err = ns.assemble().unwrap_err();
        assert!(err.to_string().starts_with("CPUD:tmpfs mount"), "{err}");
    }

    #[test]
    fn root_bind_failure_is_a_warning() {
        let tmp = TempDir::new().unwrap();
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let mut mounter = MockMounter::new();
        mounter
            .expect_mount()
            .withf(|_, _, fstype, _, _| fstype == "tmpfs")
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        mounter
            .expect_mount()
            .withf(|source, _, _, _, _| source == "/")
            .times(1)
            .returning(|_, _, _, _, _| Err(io::Error::from_raw_os_error(libc::EINVAL)));
        mounter
            .expect_mount()
            .withf(|source, _, fstype, _, _| source != "/" && fstype != "tmpfs")
            .times(2)
            .returning(|_, _, _, _, _| Ok(()));

        let mut ns = Namespace::new(
            config(&tmp, "/bin"),
            PairConnector::new(ours),
            env_with_nonce(Some("n"), true),
            Box::new(mounter),
        );
        let warning = ns.assemble().unwrap().expect("root bind failed");
        assert!(ns.failed());
        let want = format!("CPUD:Warning: binding / over {}", tmp.path().join("local").display());
        assert!(warning.to_string().starts_with(&want), "{warning}");
        assert!(warning.to_string().ends_with("continuing anyway"), "{warning}");
    }

    #[test]
    fn kernel_mount_then_binds_with_one_failure() {
        let tmp = TempDir::new().unwrap();
        let cpu = tmp.path().join("cpu");
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();

        let mut mounter = MockMounter::new();
        expect_setup(&mut mounter, tmp.path());
        let want_data = format!(
            "version=9p2000.L,trans=fd,rfdno={fd},wfdno={fd},uname=glenda,debug=0,msize=1048576"
        );
        let target9p = cpu.clone();
        mounter
            .expect_mount()
            .withf(move |source, target, fstype, flags, data| {
                source == "localhost"
                    && target == target9p
                    && fstype == "9p"
                    && *flags == MsFlags::MS_NODEV | MsFlags::MS_NOSUID
                    && data == want_data
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        let lib = cpu.join("lib").to_string_lossy().into_owned();
        let failing = lib.clone();
        mounter
            .expect_mount()
            .withf(move |source, _, _, flags, _| *flags == MsFlags::MS_BIND && source == failing)
            .times(1)
            .returning(|_, _, _, _, _| Err(io::Error::from_raw_os_error(libc::ENOENT)));
        let prefix = format!("{}/", cpu.display());
        mounter
            .expect_mount()
            .withf(move |source, target, _, flags, _| {
                *flags == MsFlags::MS_BIND
                    && source.starts_with(&prefix)
                    && source != lib
                    && target.is_absolute()
            })
            .times(2)
            .returning(|_, _, _, _, _| Ok(()));

        let mut ns = Namespace::new(
            config(&tmp, "/bin:/lib:/home=/home/glenda"),
            PairConnector::new(ours),
            env_with_nonce(Some("sekrit"), true),
            Box::new(mounter),
        );
        let warning = ns.assemble().unwrap().expect("one bind failed");
        assert!(ns.failed());
        assert_eq!(warning.failures().len(), 1);
        let want = format!("CPUD:Warning: mounting {}/lib on /lib failed:", cpu.display());
        assert!(warning.to_string().starts_with(&want), "{warning}");

        let mut sent = [0u8; 6];
        theirs.read_exact(&mut sent).unwrap();
        assert_eq!(&sent, b"sekrit");
    }

    #[test]
    fn extra_mount_options_are_appended() {
        let tmp = TempDir::new().unwrap();
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let mut mounter = MockMounter::new();
        expect_setup(&mut mounter, tmp.path());
        mounter
            .expect_mount()
            .withf(|_, _, fstype, _, data| {
                fstype == "9p" && data.ends_with(",msize=1048576,cache=loose")
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        mounter
            .expect_mount()
            .withf(|source, _, _, flags, _| *flags == MsFlags::MS_BIND && source != "/")
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));

        let mut cfg = config(&tmp, "/bin");
        cfg.mount_options = Some("cache=loose".to_string());
        let mut ns = Namespace::new(
            cfg,
            PairConnector::new(ours),
            env_with_nonce(Some("n"), true),
            Box::new(mounter),
        );
        assert!(ns.assemble().unwrap().is_none());
    }

    /// Records the gateway instead of mounting it.
    struct CapturingMounter(Arc<Mutex<Option<Arc<Gateway>>>>);

    struct NoSession;

    impl MountedGateway for NoSession {
        fn join(self: Box<Self>) {}
    }

    impl GatewayMounter for CapturingMounter {
        fn mount(&self, gateway: Arc<Gateway>, target: &Path) -> io::Result<Box<dyn MountedGateway>> {
            assert!(target.ends_with("cpu"), "{}", target.display());
            *self.0.lock().unwrap() = Some(gateway);
            Ok(Box::new(NoSession))
        }
    }

    #[test]
    fn gateway_mode_serves_through_fuse_mounter() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let nonce = Nonce::from("gw-secret".to_string());
        let server_nonce = nonce.clone();
        thread::spawn(move || {
            let fs = Arc::new(ArchiveFs::from_bytes(sample_archive()).unwrap());
            let _ = Server::new(fs).serve_authenticated(theirs, &server_nonce);
        });

        let tmp = TempDir::new().unwrap();
        let mut mounter = MockMounter::new();
        expect_setup(&mut mounter, tmp.path());
        mounter
            .expect_mount()
            .withf(|source, _, _, flags, _| *flags == MsFlags::MS_BIND && source != "/")
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        let captured = Arc::new(Mutex::new(None));

        let mut cfg = config(&tmp, "/b");
        cfg.mode = ServeMode::Gateway;
        let mut ns = Namespace::new(
            cfg,
            PairConnector::new(ours),
            env_with_nonce(Some("gw-secret"), true),
            Box::new(mounter),
        )
        .with_gateway_mounter(Box::new(CapturingMounter(captured.clone())));
        assert!(ns.assemble().unwrap().is_none());
        assert!(ns.has_gateway());

        let gateway = captured.lock().unwrap().take().expect("gateway mounted");
        let b = gateway.look_up_inode(ROOT_INODE, "b").unwrap();
        assert!(b.attr.is_dir());
        ns.wait();
        assert!(!ns.has_gateway());
        drop(nonce);
    }
}
