//! Artifact provisioning: download and unpack a backend's release archive.
//!
//! Provisioning is idempotent. An executable already present at the install
//! path short-circuits to `Ready` without touching the network. Downloads go
//! to a temporary file inside the install root and archives are unpacked into
//! a staging directory first, so a failed attempt leaves neither a partial
//! install nor a stray download behind.

use flate2::read::GzDecoder;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backend::{ArchiveFormat, ArtifactSource, BackendDescriptor, BackendKind};
use crate::error::{ErrorKind, SessionError, SessionResult};

pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(300);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CHUNK_SIZE: usize = 64 * 1024;

/// Provisioning progress of one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProvisionState {
    Absent,
    Downloading,
    Extracting,
    Ready,
    Failed { kind: ErrorKind, reason: String },
}

impl ProvisionState {
    pub fn failed(err: &SessionError) -> Self {
        ProvisionState::Failed {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ProvisionState::Ready)
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionState::Absent => write!(f, "absent"),
            ProvisionState::Downloading => write!(f, "downloading"),
            ProvisionState::Extracting => write!(f, "extracting"),
            ProvisionState::Ready => write!(f, "ready"),
            ProvisionState::Failed { reason, .. } => write!(f, "failed: {}", reason),
        }
    }
}

/// Cooperative cancellation flag shared between the caller and a provisioning run
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Checks shared by download and extraction loops
fn check_progress(deadline: Instant, cancel: &CancelToken, what: &str) -> SessionResult<()> {
    if cancel.is_cancelled() {
        return Err(SessionError::Cancelled);
    }
    if Instant::now() >= deadline {
        return Err(SessionError::Timeout(what.to_string()));
    }
    Ok(())
}

/// Source of artifact bytes
pub trait ArtifactFetcher: Send + Sync {
    /// Stream `url` into `dest`, returning the number of bytes written
    fn fetch(
        &self,
        url: &str,
        dest: &mut dyn Write,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> SessionResult<u64>;
}

/// HTTP(S) fetcher backed by reqwest's blocking client
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    connect_timeout: Duration,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

fn request_error(err: reqwest::Error) -> SessionError {
    if err.is_timeout() {
        SessionError::Timeout("download".to_string())
    } else {
        SessionError::Network(err.to_string())
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch(
        &self,
        url: &str,
        dest: &mut dyn Write,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> SessionResult<u64> {
        check_progress(deadline, cancel, "download")?;

        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("mining-session/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(request_error)?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut response = client
            .get(url)
            .timeout(remaining)
            .send()
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::Network(format!("HTTP {} from {}", status, url)));
        }

        let expected = response.content_length();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut written: u64 = 0;

        loop {
            check_progress(deadline, cancel, "download")?;
            let n = match response.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(SessionError::Timeout("download".to_string()));
                }
                Err(e) => return Err(SessionError::Network(e.to_string())),
            };
            dest.write_all(&buf[..n])
                .map_err(|e| SessionError::io("writing download", e))?;
            written += n as u64;
        }

        if let Some(expected) = expected {
            if written != expected {
                return Err(SessionError::Network(format!(
                    "truncated transfer: received {} of {} bytes",
                    written, expected
                )));
            }
        }

        debug!("Downloaded {} bytes from {}", written, url);
        Ok(written)
    }
}

/// Ensures backend executables exist under an install root
pub struct Provisioner {
    install_root: PathBuf,
    fetcher: Arc<dyn ArtifactFetcher>,
    states: Mutex<HashMap<BackendKind, ProvisionState>>,
    // one provisioning run at a time; status() stays readable meanwhile
    busy: Mutex<()>,
}

impl Provisioner {
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        Self::with_fetcher(install_root, Arc::new(HttpFetcher::new()))
    }

    pub fn with_fetcher(install_root: impl Into<PathBuf>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            install_root: install_root.into(),
            fetcher,
            states: Mutex::new(HashMap::new()),
            busy: Mutex::new(()),
        }
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn install_path(&self, descriptor: &BackendDescriptor) -> PathBuf {
        descriptor.install_path(&self.install_root)
    }

    fn is_installed(&self, descriptor: &BackendDescriptor) -> bool {
        match descriptor.executable_path(&self.install_path(descriptor)) {
            Some(executable) => executable.is_file(),
            None => true,
        }
    }

    fn set_state(&self, kind: BackendKind, state: ProvisionState) {
        debug!("Provision state of {}: {}", kind, state);
        self.states.lock().insert(kind, state);
    }

    /// Last recorded state, or what the filesystem shows when nothing was recorded
    pub fn status(&self, descriptor: &BackendDescriptor) -> ProvisionState {
        if let Some(state) = self.states.lock().get(&descriptor.kind) {
            return state.clone();
        }
        if self.is_installed(descriptor) {
            ProvisionState::Ready
        } else {
            ProvisionState::Absent
        }
    }

    /// Provision and report the resulting state
    pub fn ensure(
        &self,
        descriptor: &BackendDescriptor,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> ProvisionState {
        match self.provision(descriptor, timeout, cancel) {
            Ok(_) => ProvisionState::Ready,
            Err(e) => ProvisionState::failed(&e),
        }
    }

    /// Provision, returning the install path on success
    pub fn provision(
        &self,
        descriptor: &BackendDescriptor,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> SessionResult<PathBuf> {
        let _guard = self.busy.lock();
        let install_path = self.install_path(descriptor);

        let Some(artifact) = &descriptor.artifact else {
            fs::create_dir_all(&install_path)
                .map_err(|e| SessionError::io(format!("creating {}", install_path.display()), e))?;
            self.set_state(descriptor.kind, ProvisionState::Ready);
            return Ok(install_path);
        };

        if self.is_installed(descriptor) {
            debug!("{} already installed at {}", descriptor.kind, install_path.display());
            self.set_state(descriptor.kind, ProvisionState::Ready);
            return Ok(install_path);
        }

        let deadline = Instant::now() + timeout;
        match self.install(descriptor, artifact, &install_path, deadline, cancel) {
            Ok(()) => {
                info!("{} provisioned at {}", descriptor.kind, install_path.display());
                self.set_state(descriptor.kind, ProvisionState::Ready);
                Ok(install_path)
            }
            Err(e) => {
                warn!("Provisioning {} failed: {}", descriptor.kind, e);
                self.set_state(descriptor.kind, ProvisionState::failed(&e));
                Err(e)
            }
        }
    }

    fn install(
        &self,
        descriptor: &BackendDescriptor,
        artifact: &ArtifactSource,
        install_path: &Path,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> SessionResult<()> {
        fs::create_dir_all(&self.install_root).map_err(|e| {
            SessionError::io(format!("creating {}", self.install_root.display()), e)
        })?;

        self.set_state(descriptor.kind, ProvisionState::Downloading);
        info!("Downloading {} from {}", descriptor.kind, artifact.url);

        // removed on drop, whatever happens below
        let mut download = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".tar.gz")
            .tempfile_in(&self.install_root)
            .map_err(|e| SessionError::io("creating temporary download", e))?;
        self.fetcher
            .fetch(artifact.url, download.as_file_mut(), deadline, cancel)?;

        self.set_state(descriptor.kind, ProvisionState::Extracting);
        let archive = download.as_file_mut();
        archive
            .seek(SeekFrom::Start(0))
            .map_err(|e| SessionError::io("rewinding download", e))?;

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.install_root)
            .map_err(|e| SessionError::io("creating staging directory", e))?;

        let unpacked = match artifact.format {
            ArchiveFormat::TarGz => {
                unpack_tar_gz(archive, staging.path(), artifact.strip_components, deadline, cancel)?
            }
        };
        debug!("Unpacked {} entries for {}", unpacked, descriptor.kind);

        if let Some(executable) = descriptor.executable {
            if !staging.path().join(executable).is_file() {
                return Err(SessionError::Archive(format!(
                    "archive does not contain '{}'",
                    executable
                )));
            }
        }

        move_into_place(staging.path(), install_path)?;

        if let Some(executable) = descriptor.executable_path(install_path) {
            make_executable(&executable)?;
        }
        Ok(())
    }
}

fn archive_error(err: io::Error) -> SessionError {
    SessionError::Archive(err.to_string())
}

/// Unpack a gzip'd tarball into `dest`, dropping `strip` leading components
fn unpack_tar_gz(
    archive: &File,
    dest: &Path,
    strip: usize,
    deadline: Instant,
    cancel: &CancelToken,
) -> SessionResult<usize> {
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let mut unpacked = 0;

    for entry in tar.entries().map_err(archive_error)? {
        check_progress(deadline, cancel, "extraction")?;

        let mut entry = entry.map_err(archive_error)?;
        let path = entry.path().map_err(archive_error)?.into_owned();
        let relative: PathBuf = path
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .skip(strip)
            .collect();

        if relative.as_os_str().is_empty() {
            continue;
        }
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(SessionError::Archive(format!(
                "refusing to unpack '{}'",
                path.display()
            )));
        }

        let kind = entry.header().entry_type();
        if kind.is_hard_link() {
            return Err(SessionError::Archive(format!(
                "refusing hard link '{}'",
                path.display()
            )));
        }
        if kind.is_symlink() {
            let link = entry.link_name().map_err(archive_error)?.unwrap_or_default();
            if !is_contained_link(&link) {
                return Err(SessionError::Archive(format!(
                    "refusing symlink '{}' -> '{}'",
                    path.display(),
                    link.display()
                )));
            }
        }

        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(archive_error)?;
        }
        entry.unpack(&target).map_err(archive_error)?;
        unpacked += 1;
    }

    if unpacked == 0 {
        return Err(SessionError::Archive("archive is empty".to_string()));
    }
    Ok(unpacked)
}

/// A symlink may only point further down from where it sits, so nothing
/// written through it can land outside the unpack directory
fn is_contained_link(link: &Path) -> bool {
    !link.as_os_str().is_empty()
        && link
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Replace the install directory's entries with the staged ones
fn move_into_place(staging: &Path, install_path: &Path) -> SessionResult<()> {
    let io_err = |what: &str, path: &Path, e| SessionError::io(format!("{} {}", what, path.display()), e);

    fs::create_dir_all(install_path).map_err(|e| io_err("creating", install_path, e))?;
    let entries = fs::read_dir(staging).map_err(|e| io_err("reading", staging, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| io_err("reading", staging, e))?;
        let dest = install_path.join(entry.file_name());
        if dest.is_dir() {
            fs::remove_dir_all(&dest).map_err(|e| io_err("removing", &dest, e))?;
        } else if dest.exists() {
            fs::remove_file(&dest).map_err(|e| io_err("removing", &dest, e))?;
        }
        fs::rename(entry.path(), &dest).map_err(|e| io_err("installing", &dest, e))?;
    }
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> SessionResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)
        .map_err(|e| SessionError::io(format!("reading {}", path.display()), e))?
        .permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms)
        .map_err(|e| SessionError::io(format!("chmod {}", path.display()), e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> SessionResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::BufRead;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;

    const TEST_DESCRIPTOR: BackendDescriptor = BackendDescriptor {
        kind: BackendKind::Xmrig,
        artifact: Some(ArtifactSource {
            url: "https://downloads.invalid/xmrig-6.21.0.tar.gz",
            format: ArchiveFormat::TarGz,
            strip_components: 1,
        }),
        install_dir: "xmrig",
        executable: Some("xmrig"),
        config_file: "config.json",
    };

    enum Item<'a> {
        File(&'a str, &'a [u8]),
        Symlink(&'a str, &'a Path),
    }

    fn archive_of(items: &[Item<'_>]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for item in items {
            let mut header = tar::Header::new_gnu();
            match item {
                Item::File(name, data) => {
                    header.set_size(data.len() as u64);
                    header.set_mode(0o644);
                    header.set_cksum();
                    builder.append_data(&mut header, name, *data).unwrap();
                }
                Item::Symlink(name, target) => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    header.set_mode(0o777);
                    builder.append_link(&mut header, name, target).unwrap();
                }
            }
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn release_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let items: Vec<Item<'_>> = files.iter().map(|(name, data)| Item::File(*name, *data)).collect();
        archive_of(&items)
    }

    enum Reply {
        Bytes(Vec<u8>),
        Fail(fn() -> SessionError),
    }

    struct FakeFetcher {
        reply: Reply,
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ArtifactFetcher for FakeFetcher {
        fn fetch(
            &self,
            _url: &str,
            dest: &mut dyn Write,
            deadline: Instant,
            cancel: &CancelToken,
        ) -> SessionResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            check_progress(deadline, cancel, "download")?;
            match &self.reply {
                Reply::Bytes(bytes) => {
                    dest.write_all(bytes).unwrap();
                    Ok(bytes.len() as u64)
                }
                Reply::Fail(make) => Err(make()),
            }
        }
    }

    fn root_entries(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(root)
            .map(|rd| {
                rd.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn test_ensure_twice_fetches_once() {
        let root = tempfile::tempdir().unwrap();
        let archive = release_archive(&[
            ("xmrig-6.21.0/xmrig", b"#!/bin/sh\n"),
            ("xmrig-6.21.0/SHA256SUMS", b"abc\n"),
        ]);
        let fetcher = FakeFetcher::new(Reply::Bytes(archive));
        let provisioner = Provisioner::with_fetcher(root.path(), fetcher.clone());
        let cancel = CancelToken::new();

        assert_eq!(provisioner.status(&TEST_DESCRIPTOR), ProvisionState::Absent);
        assert_eq!(
            provisioner.ensure(&TEST_DESCRIPTOR, DEFAULT_PROVISION_TIMEOUT, &cancel),
            ProvisionState::Ready
        );
        assert_eq!(
            provisioner.ensure(&TEST_DESCRIPTOR, DEFAULT_PROVISION_TIMEOUT, &cancel),
            ProvisionState::Ready
        );
        assert_eq!(fetcher.calls(), 1);

        let executable = root.path().join("xmrig/xmrig");
        assert!(executable.is_file());
        assert!(root.path().join("xmrig/SHA256SUMS").is_file());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(fs::metadata(&executable).unwrap().permissions().mode() & 0o111, 0o111);
        }
        assert_eq!(root_entries(root.path()), vec!["xmrig"]);
    }

    #[test]
    fn test_existing_install_skips_download() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("xmrig")).unwrap();
        fs::write(root.path().join("xmrig/xmrig"), b"bin").unwrap();

        let fetcher = FakeFetcher::new(Reply::Fail(|| SessionError::Network("offline".into())));
        let provisioner = Provisioner::with_fetcher(root.path(), fetcher.clone());
        assert_eq!(provisioner.status(&TEST_DESCRIPTOR), ProvisionState::Ready);
        assert!(provisioner
            .provision(&TEST_DESCRIPTOR, DEFAULT_PROVISION_TIMEOUT, &CancelToken::new())
            .is_ok());
        assert_eq!(fetcher.calls(), 0);
    }

    #[test]
    fn test_network_failure_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::new(Reply::Fail(|| SessionError::Network("connection refused".into())));
        let provisioner = Provisioner::with_fetcher(root.path(), fetcher);

        let state = provisioner.ensure(&TEST_DESCRIPTOR, DEFAULT_PROVISION_TIMEOUT, &CancelToken::new());
        assert!(matches!(state, ProvisionState::Failed { kind: ErrorKind::Network, .. }));
        assert_eq!(provisioner.status(&TEST_DESCRIPTOR), state);
        assert!(root_entries(root.path()).is_empty());
    }

    #[test]
    fn test_corrupt_archive_is_archive_error() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::new(Reply::Bytes(b"this is not a tarball".to_vec()));
        let provisioner = Provisioner::with_fetcher(root.path(), fetcher);

        let state = provisioner.ensure(&TEST_DESCRIPTOR, DEFAULT_PROVISION_TIMEOUT, &CancelToken::new());
        assert!(matches!(state, ProvisionState::Failed { kind: ErrorKind::Archive, .. }), "{:?}", state);
        assert!(root_entries(root.path()).is_empty());
    }

    #[test]
    fn test_archive_without_executable_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let archive = release_archive(&[("xmrig-6.21.0/README.md", b"readme")]);
        let provisioner = Provisioner::with_fetcher(root.path(), FakeFetcher::new(Reply::Bytes(archive)));

        let err = provisioner
            .provision(&TEST_DESCRIPTOR, DEFAULT_PROVISION_TIMEOUT, &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Archive);
        assert!(!root.path().join("xmrig").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_out_of_install_root_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();

        for target in [outside.path(), Path::new("../../..")] {
            let archive = archive_of(&[
                Item::Symlink("xmrig-6.21.0/link", target),
                Item::File("xmrig-6.21.0/link/escaped.txt", b"gotcha"),
                Item::File("xmrig-6.21.0/xmrig", b"bin"),
            ]);
            let provisioner = Provisioner::with_fetcher(root.path(), FakeFetcher::new(Reply::Bytes(archive)));

            let state = provisioner.ensure(&TEST_DESCRIPTOR, DEFAULT_PROVISION_TIMEOUT, &CancelToken::new());
            assert!(matches!(state, ProvisionState::Failed { kind: ErrorKind::Archive, .. }), "{:?}", state);
            assert!(!outside.path().join("escaped.txt").exists());
            assert!(root_entries(root.path()).is_empty());
        }
        assert!(!root.path().parent().unwrap().join("escaped.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_release_is_kept() {
        let root = tempfile::tempdir().unwrap();
        let archive = archive_of(&[
            Item::File("xmrig-6.21.0/bin/xmrig-6.21.0", b"bin"),
            Item::Symlink("xmrig-6.21.0/xmrig", Path::new("bin/xmrig-6.21.0")),
        ]);
        let provisioner = Provisioner::with_fetcher(root.path(), FakeFetcher::new(Reply::Bytes(archive)));

        assert_eq!(
            provisioner.ensure(&TEST_DESCRIPTOR, DEFAULT_PROVISION_TIMEOUT, &CancelToken::new()),
            ProvisionState::Ready
        );
        let executable = root.path().join("xmrig/xmrig");
        assert!(fs::symlink_metadata(&executable).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&executable).unwrap(), b"bin");
    }

    #[test]
    fn test_cancelled_before_download() {
        let root = tempfile::tempdir().unwrap();
        let archive = release_archive(&[("xmrig-6.21.0/xmrig", b"bin")]);
        let provisioner = Provisioner::with_fetcher(root.path(), FakeFetcher::new(Reply::Bytes(archive)));
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = provisioner
            .provision(&TEST_DESCRIPTOR, DEFAULT_PROVISION_TIMEOUT, &cancel)
            .unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
        assert!(root_entries(root.path()).is_empty());
    }

    #[test]
    fn test_zero_timeout_is_timeout_error() {
        let root = tempfile::tempdir().unwrap();
        let archive = release_archive(&[("xmrig-6.21.0/xmrig", b"bin")]);
        let provisioner = Provisioner::with_fetcher(root.path(), FakeFetcher::new(Reply::Bytes(archive)));

        let state = provisioner.ensure(&TEST_DESCRIPTOR, Duration::ZERO, &CancelToken::new());
        assert!(matches!(state, ProvisionState::Failed { kind: ErrorKind::Timeout, .. }));
    }

    #[test]
    fn test_simulated_backend_needs_nothing() {
        let root = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::new(Reply::Fail(|| SessionError::Network("offline".into())));
        let provisioner = Provisioner::with_fetcher(root.path(), fetcher.clone());
        let descriptor = BackendKind::Simulated.descriptor();

        assert_eq!(provisioner.status(descriptor), ProvisionState::Ready);
        assert_eq!(
            provisioner.ensure(descriptor, DEFAULT_PROVISION_TIMEOUT, &CancelToken::new()),
            ProvisionState::Ready
        );
        assert_eq!(fetcher.calls(), 0);
    }

    #[test]
    fn test_http_unreachable_host_is_network_error() {
        let mut sink = Vec::new();
        let err = HttpFetcher::new()
            .fetch(
                "http://127.0.0.1:9/xmrig.tar.gz",
                &mut sink,
                Instant::now() + Duration::from_secs(10),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(sink.is_empty());
    }

    /// Serve one canned HTTP response on a local port
    fn serve_once(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut reader = io::BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                while reader.read_line(&mut line).unwrap_or(0) > 2 {
                    line.clear();
                }
                let _ = stream.write_all(response);
            }
        });
        format!("http://{}/artifact.tar.gz", addr)
    }

    #[test]
    fn test_http_error_status_is_network_error() {
        let url = serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        let err = HttpFetcher::new()
            .fetch(&url, &mut Vec::new(), Instant::now() + Duration::from_secs(10), &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_http_truncated_body_is_network_error() {
        let url = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\nonly ten b");
        let err = HttpFetcher::new()
            .fetch(&url, &mut Vec::new(), Instant::now() + Duration::from_secs(10), &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[test]
    fn test_http_download_succeeds() {
        let url = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello");
        let mut sink = Vec::new();
        let written = HttpFetcher::new()
            .fetch(&url, &mut sink, Instant::now() + Duration::from_secs(10), &CancelToken::new())
            .unwrap();
        assert_eq!(written, 5);
        assert_eq!(sink, b"hello");
    }
}
