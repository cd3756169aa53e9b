// SFTP backend serving the local filesystem

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, info};

enum OpenHandle {
    File(fs::File),
    Dir {
        path: PathBuf,
        /// Cleared once the listing has been sent
        pending: bool,
    },
}

/// Serves requests against the real filesystem; relative paths start at `root`.
///
/// Dropping the backend (which happens when the client goes away) resolves
/// the receiver handed out by [`LocalFs::with_done_signal`].
pub struct LocalFs {
    root: PathBuf,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
    done: Option<oneshot::Sender<()>>,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handles: HashMap::new(),
            next_handle: 0,
            done: None,
        }
    }

    pub fn with_done_signal(mut self, done: oneshot::Sender<()>) -> Self {
        self.done = Some(done);
        self
    }

    /// Absolute, lexically normalized form of a client path
    pub fn resolve(&self, path: &str) -> PathBuf {
        let joined = if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        };
        normalize(&joined)
    }

    fn insert(&mut self, handle: OpenHandle) -> String {
        self.next_handle += 1;
        let key = self.next_handle.to_string();
        self.handles.insert(key.clone(), handle);
        key
    }

    fn file(&mut self, handle: &str) -> Result<&mut fs::File, StatusCode> {
        match self.handles.get_mut(handle) {
            Some(OpenHandle::File(file)) => Ok(file),
            Some(OpenHandle::Dir { .. }) => Err(StatusCode::Failure),
            None => Err(StatusCode::BadMessage),
        }
    }
}

impl Drop for LocalFs {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

fn status_of(e: io::Error) -> StatusCode {
    debug!("sftp: {}", e);
    match e.kind() {
        io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn ok(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

async fn apply_attrs(path: &Path, attrs: &FileAttributes) -> io::Result<()> {
    if let Some(mode) = attrs.permissions {
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777)).await?;
    }
    if let Some(size) = attrs.size {
        let file = fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(size).await?;
    }
    Ok(())
}

impl russh_sftp::server::Handler for LocalFs {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        info!(version, root = %self.root.display(), "SFTP client initialized");
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let path = self.resolve(&filename);
        let mut options = std::fs::OpenOptions::from(pflags);
        if let Some(mode) = attrs.permissions {
            options.mode(mode & 0o7777);
        }

        let file = fs::OpenOptions::from(options)
            .open(&path)
            .await
            .map_err(status_of)?;
        Ok(Handle {
            id,
            handle: self.insert(OpenHandle::File(file)),
        })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(OpenHandle::File(mut file)) => {
                file.flush().await.map_err(status_of)?;
                Ok(ok(id))
            }
            Some(OpenHandle::Dir { .. }) => Ok(ok(id)),
            None => Err(StatusCode::BadMessage),
        }
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.file(&handle)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(status_of)?;

        let mut data = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = file.read(&mut data[filled..]).await.map_err(status_of)?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 && len > 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(filled);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let file = self.file(&handle)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(status_of)?;
        file.write_all(&data).await.map_err(status_of)?;
        Ok(ok(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let meta = fs::symlink_metadata(self.resolve(&path))
            .await
            .map_err(status_of)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&meta),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let meta = match self.handles.get(&handle) {
            Some(OpenHandle::File(file)) => file.metadata().await,
            Some(OpenHandle::Dir { path, .. }) => fs::metadata(path).await,
            None => return Err(StatusCode::BadMessage),
        }
        .map_err(status_of)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&meta),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        apply_attrs(&self.resolve(&path), &attrs)
            .await
            .map_err(status_of)?;
        Ok(ok(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let file = self.file(&handle)?;
        if let Some(mode) = attrs.permissions {
            file.set_permissions(std::fs::Permissions::from_mode(mode & 0o7777))
                .await
                .map_err(status_of)?;
        }
        if let Some(size) = attrs.size {
            file.set_len(size).await.map_err(status_of)?;
        }
        Ok(ok(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let path = self.resolve(&path);
        let meta = fs::metadata(&path).await.map_err(status_of)?;
        if !meta.is_dir() {
            return Err(StatusCode::NoSuchFile);
        }
        Ok(Handle {
            id,
            handle: self.insert(OpenHandle::Dir {
                path,
                pending: true,
            }),
        })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let path = match self.handles.get_mut(&handle) {
            Some(OpenHandle::Dir { pending, path }) if *pending => {
                *pending = false;
                path.clone()
            }
            Some(OpenHandle::Dir { .. }) => return Err(StatusCode::Eof),
            _ => return Err(StatusCode::BadMessage),
        };

        let mut files = Vec::new();
        let mut entries = fs::read_dir(&path).await.map_err(status_of)?;
        while let Some(entry) = entries.next_entry().await.map_err(status_of)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            match fs::symlink_metadata(entry.path()).await {
                Ok(meta) => files.push(File::new(name, FileAttributes::from(&meta))),
                Err(e) => debug!("sftp: skipping {}: {}", name, e),
            }
        }
        Ok(Name { id, files })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        fs::remove_file(self.resolve(&filename))
            .await
            .map_err(status_of)?;
        Ok(ok(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let path = self.resolve(&path);
        fs::create_dir(&path).await.map_err(status_of)?;
        if let Some(mode) = attrs.permissions {
            fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777))
                .await
                .map_err(status_of)?;
        }
        Ok(ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        fs::remove_dir(self.resolve(&path))
            .await
            .map_err(status_of)?;
        Ok(ok(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = self.resolve(&path);
        let real = fs::canonicalize(&resolved).await.unwrap_or(resolved);
        Ok(Name {
            id,
            files: vec![File::dummy(real.to_string_lossy())],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let meta = fs::metadata(self.resolve(&path))
            .await
            .map_err(status_of)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&meta),
        })
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        fs::rename(self.resolve(&oldpath), self.resolve(&newpath))
            .await
            .map_err(status_of)?;
        Ok(ok(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let target = fs::read_link(self.resolve(&path))
            .await
            .map_err(status_of)?;
        Ok(Name {
            id,
            files: vec![File::dummy(target.to_string_lossy())],
        })
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        fs::symlink(&targetpath, self.resolve(&linkpath))
            .await
            .map_err(status_of)?;
        Ok(ok(id))
    }
}
