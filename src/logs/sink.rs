use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

/// One size-bounded log file with numbered rotations.
///
/// The active file lives at `path`; rotated files are `path.1` (newest) up to
/// `path.<retain>` (oldest). The file is opened lazily so a sink can be built
/// before its directory exists, and a failed open is retried on the next write.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: Option<File>,
    size: u64,
    rotations: u64,
    max_size: Option<u64>,
    retain: usize,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>, max_size: Option<u64>, retain: usize) -> Self {
        Self {
            path: path.into(),
            file: None,
            size: 0,
            rotations: 0,
            max_size,
            retain,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in the active file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Rotations performed by this sink since it was created.
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    pub fn rotated_path(&self, index: usize) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    /// Appends `bytes`, rotating first if they would push the file past
    /// `max_size`. A single write larger than `max_size` still lands in one
    /// (fresh) file.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.open()?;
        if self.needs_rotation(bytes.len() as u64) {
            self.rotate()?;
        }
        self.open()?.write_all(bytes)?;
        self.size += bytes.len() as u64;
        Ok(())
    }

    fn needs_rotation(&self, incoming: u64) -> bool {
        match self.max_size {
            Some(max_size) => self.size > 0 && self.size.saturating_add(incoming) > max_size,
            None => false,
        }
    }

    fn open(&mut self) -> io::Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?;
                self.size = file.metadata()?.len();
                file
            }
        };
        Ok(self.file.insert(file))
    }

    /// Closes the active file and shifts the numbered files by one, dropping
    /// the oldest beyond `retain`. The next write opens a fresh file.
    pub fn rotate(&mut self) -> io::Result<()> {
        drop(self.file.take());
        if self.retain == 0 {
            remove_if_exists(&self.path)?;
        } else {
            remove_if_exists(&self.rotated_path(self.retain))?;
            for index in (1..self.retain).rev() {
                rename_if_exists(&self.rotated_path(index), &self.rotated_path(index + 1))?;
            }
            rename_if_exists(&self.path, &self.rotated_path(1))?;
        }
        self.size = 0;
        self.rotations += 1;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn rename_if_exists(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
