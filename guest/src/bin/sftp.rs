//! Standalone SFTP server over stdin/stdout.
//!
//! Deployed into instances by the gateway and exec'd with the SSH channel
//! as its stdio. Reads `UID`/`GID`/`HOME` from the environment, optionally
//! chroots to the start directory, drops privileges, and serves the
//! standard SFTP operations on the local filesystem.
//!
//! Flags: `-e` serve on stdio (the only mode), `-d <dir>` start directory,
//! `-c` chroot to the start directory before dropping privileges.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Context;
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

#[derive(Debug, Default)]
struct Options {
    start_dir: Option<PathBuf>,
    chroot: bool,
}

fn parse_args() -> anyhow::Result<Options> {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-e" => {}
            "-d" => {
                let dir = args.next().context("-d requires a directory")?;
                options.start_dir = Some(PathBuf::from(dir));
            }
            "-c" => options.chroot = true,
            other => anyhow::bail!("unknown flag: {other}"),
        }
    }
    Ok(options)
}

fn env_id(name: &str) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Chroot (optionally), change into the start directory, drop to the
/// target uid/gid, and set a sane umask.
fn drop_privileges(options: &Options, uid: u32, gid: u32) -> anyhow::Result<()> {
    use nix::unistd::{setgid, setgroups, setuid, Gid, Uid};

    let start = options
        .start_dir
        .clone()
        .or_else(|| std::env::var("HOME").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("/"));

    if options.chroot {
        nix::unistd::chroot(&start).with_context(|| format!("chroot {}", start.display()))?;
        std::env::set_current_dir("/").context("chdir after chroot")?;
    } else {
        std::env::set_current_dir(&start)
            .with_context(|| format!("chdir {}", start.display()))?;
    }

    if gid != 0 {
        let gid = Gid::from_raw(gid);
        setgroups(&[gid]).context("setgroups")?;
        setgid(gid).context("setgid")?;
    }
    if uid != 0 {
        setuid(Uid::from_raw(uid)).context("setuid")?;
    }

    nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(0o022));
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let options = parse_args()?;
    let uid = env_id("UID");
    let gid = env_id("GID");
    drop_privileges(&options, uid, gid)?;

    let stream = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    russh_sftp::server::run(stream, SftpSession::default()).await;
    Ok(())
}

/// One SFTP session on the local filesystem.
#[derive(Default)]
struct SftpSession {
    next_handle: u64,
    files: HashMap<String, tokio::fs::File>,
    /// Directory listings are read eagerly at opendir and handed out in
    /// one readdir batch; the second readdir returns EOF.
    dirs: HashMap<String, Option<Vec<File>>>,
}

impl SftpSession {
    fn new_handle(&mut self) -> String {
        self.next_handle += 1;
        self.next_handle.to_string()
    }

    fn ok(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        }
    }
}

fn io_status(e: &std::io::Error) -> StatusCode {
    match e.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn entry_file(name: &str, metadata: &std::fs::Metadata) -> File {
    File::new(name, FileAttributes::from(metadata))
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        let _ = version;
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let mut opts = tokio::fs::OpenOptions::new();
        opts.read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE))
            .append(pflags.contains(OpenFlags::APPEND))
            .create(pflags.contains(OpenFlags::CREATE))
            .truncate(pflags.contains(OpenFlags::TRUNCATE));
        let file = opts.open(&filename).await.map_err(|e| io_status(&e))?;
        let handle = self.new_handle();
        self.files.insert(handle.clone(), file);
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        if let Some(mut file) = self.files.remove(&handle) {
            let _ = file.flush().await;
        }
        self.dirs.remove(&handle);
        Ok(Self::ok(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.files.get_mut(&handle).ok_or(StatusCode::Failure)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_status(&e))?;
        let mut buf = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| io_status(&e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Err(StatusCode::Eof);
        }
        buf.truncate(filled);
        Ok(Data { id, data: buf })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let file = self.files.get_mut(&handle).ok_or(StatusCode::Failure)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_status(&e))?;
        file.write_all(&data).await.map_err(|e| io_status(&e))?;
        Ok(Self::ok(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| io_status(&e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let file = self.files.get(&handle).ok_or(StatusCode::Failure)?;
        let metadata = file.metadata().await.map_err(|e| io_status(&e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        if let Some(permissions) = attrs.permissions {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(permissions))
                .await
                .map_err(|e| io_status(&e))?;
        }
        if let Some(size) = attrs.size {
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| io_status(&e))?;
            file.set_len(size).await.map_err(|e| io_status(&e))?;
        }
        Ok(Self::ok(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&path).await.map_err(|e| io_status(&e))?;
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata().await {
                Ok(metadata) => entries.push(entry_file(&name, &metadata)),
                Err(_) => entries.push(File::dummy(name.as_str())),
            }
        }
        let handle = self.new_handle();
        self.dirs.insert(handle.clone(), Some(entries));
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let slot = self.dirs.get_mut(&handle).ok_or(StatusCode::Failure)?;
        match slot.take() {
            Some(files) => Ok(Name { id, files }),
            None => Err(StatusCode::Eof),
        }
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_file(&filename)
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Self::ok(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        tokio::fs::create_dir(&path).await.map_err(|e| io_status(&e))?;
        Ok(Self::ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_dir(&path).await.map_err(|e| io_status(&e))?;
        Ok(Self::ok(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = resolve_path(Path::new(&path));
        let resolved = resolved.to_string_lossy().into_owned();
        Ok(Name {
            id,
            files: vec![File::dummy(resolved.as_str())],
        })
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        tokio::fs::rename(&oldpath, &newpath)
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Self::ok(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let target = tokio::fs::read_link(&path).await.map_err(|e| io_status(&e))?;
        let target = target.to_string_lossy().into_owned();
        Ok(Name {
            id,
            files: vec![File::dummy(target.as_str())],
        })
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        tokio::fs::symlink(&targetpath, &linkpath)
            .await
            .map_err(|e| io_status(&e))?;
        Ok(Self::ok(id))
    }
}

/// Lexically absolutize a path against the current directory.
///
/// `canonicalize` would fail on paths that do not exist yet, which
/// clients legitimately ask about (upload targets).
fn resolve_path(path: &Path) -> PathBuf {
    let base = if path.is_absolute() {
        PathBuf::from("/")
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
    };
    let mut out = base;
    for component in path.components() {
        use std::path::Component;
        match component {
            Component::RootDir | Component::Prefix(_) => out = PathBuf::from("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        out
    }
}
