// 下载临时文件：定位写 + 刷盘 + 完成后重命名

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// 串行化目录创建，避免并发会话同时 create_dir_all 时互相干扰
static FS_LOCK: Mutex<()> = parking_lot::const_mutex(());

struct Inner {
    file: File,
    /// 当前文件指针位置，相同偏移的连续写不再 seek
    cursor: u64,
}

/// 预分配的目标临时文件
///
/// 所有分片共享同一个句柄，写入在互斥锁内完成。
pub struct TargetFile {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl TargetFile {
    /// 创建（或截断）文件，已知大小时预分配
    pub fn create_fixed(path: &Path, size: Option<u64>) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _guard = FS_LOCK.lock();
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        if let Some(size) = size {
            file.set_len(size)?;
        }
        debug!("已创建临时文件: {:?}, 预分配 {:?} bytes", path, size);

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner { file, cursor: 0 }),
        })
    }

    /// 打开已有文件（续传）
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner { file, cursor: 0 }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 在指定偏移写入全部数据
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        if inner.cursor != offset {
            inner.file.seek(SeekFrom::Start(offset))?;
            inner.cursor = offset;
        }
        if let Err(e) = inner.file.write_all(data) {
            // 写失败后指针位置不确定，下次强制 seek
            inner.cursor = u64::MAX;
            return Err(e);
        }
        inner.cursor = offset + data.len() as u64;
        Ok(data.len())
    }

    /// 把已写入的数据刷到磁盘
    pub fn flush(&self) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.file.flush()?;
        inner.file.sync_data()
    }

    /// 关闭句柄并重命名到最终路径
    pub fn rename_to(self, target: &Path, overwrite: bool) -> io::Result<()> {
        let TargetFile { path, inner } = self;
        {
            let mut inner = inner.lock();
            inner.file.flush()?;
            inner.file.sync_all()?;
        }
        drop(inner);

        if target.exists() {
            if !overwrite {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("目标文件已存在: {:?}", target),
                ));
            }
            fs::remove_file(target)?;
        }
        fs::rename(&path, target)?;
        debug!("临时文件已重命名: {:?} -> {:?}", path, target);
        Ok(())
    }
}

impl std::fmt::Debug for TargetFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetFile").field("path", &self.path).finish()
    }
}
