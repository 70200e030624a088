//! Install media: fetching, validation and staging.
//!
//! Media is an ISO image, either a local file or an HTTP(S) URL. URLs
//! are downloaded once into a cache keyed by the hash of the URL. A
//! cached file may be truncated or stale, so when it fails validation
//! it is downloaded again, exactly once.
use crate::{
    config::{HostPaths, MediaKindRequest},
    error::Error,
    utilities::process,
};
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::{
    ffi::OsStr,
    fmt,
    fs::{self, File},
    io::{self, Read},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

/// Operating system flavour of the install media.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MediaKind {
    Rhel,
    Rhcos,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Rhel, MediaKind::Rhcos];

    /// Files that must be present (and readable) on mounted media.
    pub fn check_files(self) -> &'static [&'static str] {
        match self {
            MediaKind::Rhel => &[
                "EFI/BOOT/grubaa64.efi",
                "images/pxeboot/initrd.img",
                "images/pxeboot/vmlinuz",
                "media.repo",
            ],
            MediaKind::Rhcos => &[
                "images/efiboot.img",
                "images/ignition.img",
                "images/pxeboot/initrd.img",
                "images/pxeboot/rootfs.img",
                "images/pxeboot/vmlinuz",
            ],
        }
    }

    /// Boot file name handed out by DHCP.
    pub fn boot_filename(self) -> &'static str {
        match self {
            MediaKind::Rhel => "/grubaa64.efi",
            MediaKind::Rhcos => "/BOOTAA64.EFI",
        }
    }

    pub fn ssh_user(self) -> &'static str {
        match self {
            MediaKind::Rhel => "root",
            MediaKind::Rhcos => "core",
        }
    }

    fn accepts(self, request: MediaKindRequest) -> bool {
        match request {
            MediaKindRequest::Auto => true,
            MediaKindRequest::Rhel => self == MediaKind::Rhel,
            MediaKindRequest::Rhcos => self == MediaKind::Rhcos,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Rhel => write!(f, "rhel"),
            MediaKind::Rhcos => write!(f, "rhcos"),
        }
    }
}

/// EFI loaders inside the nested `images/efiboot.img` of CoreOS media.
pub const EFIBOOT_FILES: [&str; 2] = ["EFI/BOOT/BOOTAA64.EFI", "EFI/BOOT/grubaa64.efi"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    Local(PathBuf),
    Remote(String),
}

impl MediaSource {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.starts_with("http://") || text.starts_with("https://") {
            MediaSource::Remote(text.to_owned())
        } else {
            MediaSource::Local(PathBuf::from(text))
        }
    }
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::Local(path) => write!(f, "{}", path.display()),
            MediaSource::Remote(url) => write!(f, "{}", url),
        }
    }
}

/// Media ready on the local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub path: PathBuf,
    /// Served from a copy that was already in the cache, which may be
    /// stale or truncated.
    pub from_cache: bool,
}

/// Where media comes from and how it is checked.
pub trait MediaStore {
    /// Local copy of the media. With `force`, remote sources are
    /// downloaded again even if a cached copy exists.
    fn fetch(&mut self, source: &MediaSource, force: bool) -> Result<Fetched, Error>;

    /// Mounts the media and detects its kind. `None` means the media is
    /// unusable or not of the requested kind.
    fn validate(&mut self, path: &Path, request: MediaKindRequest) -> Result<Option<MediaKind>, Error>;
}

/// Fetches and validates the media. A copy served from the cache that
/// does not validate is downloaded again, once.
pub fn resolve_media<S: MediaStore>(
    store: &mut S,
    source: &MediaSource,
    request: MediaKindRequest,
) -> Result<MediaKind, Error> {
    let mut retry = false;
    loop {
        let Fetched { path, from_cache } = store.fetch(source, retry)?;
        if let Some(kind) = store.validate(&path, request)? {
            info!("media: {} is usable (as {})", path.display(), kind);
            return Ok(kind);
        }
        warn!("media: {} does not look like media of kind {}", path.display(), request);

        if retry || !from_cache {
            return Err(Error::MediaInvalid(format!("Failure to mount media {}", source)));
        }
        warn!("media: {} seems broken. Try re-downloading {}", path.display(), source);
        retry = true;
    }
}

/// First kind whose files are all present and readable under `root`.
pub fn detect_kind(root: &Path, request: MediaKindRequest) -> Option<MediaKind> {
    MediaKind::ALL
        .iter()
        .copied()
        .filter(|kind| kind.accepts(request))
        .find(|kind| files_readable(root, kind.check_files()))
}

/// Every file exists and its first bytes can be read; unreadable loop
/// mounted media fails here rather than during the install.
pub fn files_readable(root: &Path, files: &[&str]) -> bool {
    files.iter().all(|file| {
        let mut probe = [0u8; 4096];
        File::open(root.join(file)).and_then(|mut f| f.read(&mut probe)).is_ok()
    })
}

/// Cache file for a URL: hash prefix plus the URL's base name.
pub fn cache_path(cache_dir: &Path, url: &str) -> PathBuf {
    let digest = Sha256::digest(url.as_bytes());
    let prefix: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    let name = url.trim_end_matches('/').rsplit('/').next().filter(|n| !n.is_empty()).unwrap_or("media.iso");
    cache_dir.join(format!("{}-{}", prefix, name))
}

/// Media store backed by the host: reqwest downloads and loop mounts.
pub struct HostMediaStore {
    cache_dir: PathBuf,
    mount: PathBuf,
    efiboot_mount: PathBuf,
}

impl HostMediaStore {
    pub fn new(paths: &HostPaths) -> Self {
        Self {
            cache_dir: paths.cache_dir.clone(),
            mount: paths.media_mount.clone(),
            efiboot_mount: paths.efiboot_mount.clone(),
        }
    }

    /// CoreOS keeps its EFI loaders in a nested image; mount it too.
    pub fn mount_nested(&mut self, kind: MediaKind) -> Result<(), Error> {
        if kind != MediaKind::Rhcos {
            return Ok(());
        }
        let image = self.mount.join("images/efiboot.img");
        unmount(&self.efiboot_mount);
        if !loop_mount(&image, &self.efiboot_mount)? {
            return Err(Error::MediaInvalid(format!(
                "Failure to mount {} on {}",
                image.display(),
                self.efiboot_mount.display()
            )));
        }
        if !files_readable(&self.efiboot_mount, &EFIBOOT_FILES) {
            return Err(Error::MediaInvalid(format!("Cannot find expected files in {}", image.display())));
        }
        Ok(())
    }

    fn download(&self, url: &str, target: &Path) -> Result<(), Error> {
        info!("media: downloading {} to {}", url, target.display());
        fs::create_dir_all(&self.cache_dir)?;
        let partial = target.with_extension("part");
        let failed = |e: reqwest::Error| Error::CommandFailed { command: format!("GET {} ({})", url, e), status: None };

        let mut response = reqwest::blocking::Client::builder()
            .timeout(None)
            .build()
            .and_then(|client| client.get(url).send())
            .and_then(|response| response.error_for_status())
            .map_err(failed)?;
        let mut file = File::create(&partial)?;
        io::copy(&mut response, &mut file)?;
        fs::rename(&partial, target)?;
        Ok(())
    }
}

impl MediaStore for HostMediaStore {
    fn fetch(&mut self, source: &MediaSource, force: bool) -> Result<Fetched, Error> {
        match source {
            MediaSource::Local(path) if path.is_file() => Ok(Fetched { path: path.clone(), from_cache: false }),
            MediaSource::Local(path) => {
                Err(Error::MediaInvalid(format!("Media {} does not exist", path.display())))
            }
            MediaSource::Remote(url) => {
                let target = cache_path(&self.cache_dir, url);
                let from_cache = !force && target.is_file();
                if from_cache {
                    info!("media: using cached {} for {}", target.display(), url);
                } else {
                    self.download(url, &target)?;
                }
                Ok(Fetched { path: target, from_cache })
            }
        }
    }

    fn validate(&mut self, path: &Path, request: MediaKindRequest) -> Result<Option<MediaKind>, Error> {
        unmount(&self.efiboot_mount);
        unmount(&self.mount);
        if !loop_mount(path, &self.mount)? {
            return Ok(None);
        }
        let kind = detect_kind(&self.mount, request);
        if kind.is_none() {
            unmount(&self.mount);
        }
        Ok(kind)
    }
}

fn loop_mount(image: &Path, mount_point: &Path) -> Result<bool, Error> {
    fs::create_dir_all(mount_point)?;
    Ok(process::succeeds("mount", &[
        OsStr::new("-o"),
        OsStr::new("loop,ro"),
        image.as_os_str(),
        mount_point.as_os_str(),
    ]))
}

fn unmount(mount_point: &Path) { let _ = process::run("umount", &[mount_point]); }

/// Copies what the card fetches over TFTP: kernel and initrd under
/// `pxelinux/`, the EFI loader(s) and an optional grub configuration at
/// the root.
pub fn stage_tftp(
    kind: MediaKind,
    paths: &HostPaths,
    grub_config: Option<&Path>,
) -> Result<(), Error> {
    let tftp = &paths.tftp_root;
    let pxelinux = tftp.join("pxelinux");
    fs::create_dir_all(&pxelinux)?;
    for file in ["vmlinuz", "initrd.img"] {
        copy(&paths.media_mount.join("images/pxeboot").join(file), &pxelinux.join(file))?;
    }
    match kind {
        MediaKind::Rhel => {
            let loader = tftp.join("grubaa64.efi");
            copy(&paths.media_mount.join("EFI/BOOT/grubaa64.efi"), &loader)?;
            fs::set_permissions(&loader, fs::Permissions::from_mode(0o744))?;
        }
        MediaKind::Rhcos => {
            for file in EFIBOOT_FILES {
                let name = Path::new(file).file_name().unwrap_or_default();
                copy(&paths.efiboot_mount.join(file), &tftp.join(name))?;
            }
        }
    }
    if let Some(grub_config) = grub_config {
        copy(grub_config, &tftp.join("grub.cfg"))?;
    }
    Ok(())
}

/// Prepares the HTTP root: a link to the mounted media, the keys for the
/// installed OS and any pre-rendered payloads.
pub fn stage_http(paths: &HostPaths, authorized_keys: &[&str], payloads: &[PathBuf]) -> Result<(), Error> {
    let www = &paths.www_root;
    fs::create_dir_all(www)?;

    let link = www.join("marvell_dpu_iso");
    match fs::symlink_metadata(&link) {
        Ok(_) => fs::remove_file(&link)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => (),
        Err(e) => return Err(e.into()),
    }
    std::os::unix::fs::symlink(&paths.media_mount, &link)?;

    let mut keys = authorized_keys.join("\n");
    keys.push('\n');
    fs::write(www.join("authorized_keys"), keys)?;

    for payload in payloads {
        let name = payload.file_name().ok_or_else(|| {
            Error::ConfigurationError(format!("Payload {} has no file name", payload.display()))
        })?;
        copy(payload, &www.join(name))?;
    }
    Ok(())
}

fn copy(from: &Path, to: &Path) -> Result<(), Error> {
    fs::copy(from, to).map(|_| ()).map_err(|e| {
        Error::Io(io::Error::new(e.kind(), format!("copy {} to {}: {}", from.display(), to.display(), e)))
    })
}
