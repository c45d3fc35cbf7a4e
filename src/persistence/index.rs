//! 续传索引文件读写
//!
//! ## 文件格式
//!
//! 索引文件与目标文件同目录，扩展名为 `.resumeindex`：
//! ```text
//! SLICEDL-RESUME-INDEX/1
//! {"update_time":1700000000,"file_size":1048576,"content_hash":"","url":"...", ...}
//! ```
//!
//! 第一行是固定签名，第二行起是 JSON。写入时先写 `.tmp` 再原子重命名。

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use super::types::ResumeSnapshot;
use crate::transport::ResourceInfo;

/// 索引文件签名
pub const INDEX_SIGNATURE: &str = "SLICEDL-RESUME-INDEX/1";

/// 索引被拒绝的原因，任何一种都会导致全新下载
#[derive(Debug, Error)]
pub enum IndexRejection {
    #[error("索引文件不存在")]
    Missing,

    #[error("读取索引文件失败: {0}")]
    Read(#[source] io::Error),

    #[error("索引签名不匹配")]
    BadSignature,

    #[error("索引内容解析失败: {0}")]
    Parse(String),

    #[error("索引已过期（{age_secs} 秒）")]
    Expired { age_secs: u64 },

    #[error("文件大小已变化: 索引 {persisted}, 当前 {current}")]
    FileSizeChanged { persisted: i64, current: i64 },

    #[error("服务器内容哈希已变化")]
    ContentHashChanged,

    #[error("下载链接已变化")]
    UrlChanged,

    #[error("重定向地址已变化")]
    RedirectUrlChanged,

    #[error("服务器不支持 Range，无法续传")]
    RangeUnsupported,

    #[error("临时文件路径已变化: {0:?}")]
    TmpPathChanged(PathBuf),

    #[error("临时文件不存在: {0:?}")]
    TmpFileMissing(PathBuf),

    #[error("临时文件不可读写 {path:?}: {source}")]
    TmpFileNotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("临时文件大小不符: 期望 {expected}, 实际 {actual}")]
    TmpFileSizeMismatch { expected: u64, actual: u64 },

    #[error("分片记录无效: {0}")]
    InvalidSlices(String),
}

/// 本次运行的期望值，用于判断索引能否复用
#[derive(Debug, Clone)]
pub struct IndexExpectation<'a> {
    pub url: &'a str,
    pub info: &'a ResourceInfo,
    pub max_age: Option<Duration>,
    pub check_content_hash: bool,
    pub check_redirect_url: bool,
}

/// 保存索引（先写临时文件再原子重命名）
///
/// # Arguments
/// * `path` - 索引文件路径
/// * `snapshot` - 分片快照
pub fn save_index(path: &Path, snapshot: &ResumeSnapshot) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let temp_path = PathBuf::from(tmp);

    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{}", INDEX_SIGNATURE)?;
    serde_json::to_writer(&mut writer, snapshot).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize resume index: {}", e),
        )
    })?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;
    debug!(
        "已保存续传索引: {:?} ({} 个分片, 已落盘 {} bytes)",
        path,
        snapshot.slices.len(),
        snapshot.persisted_bytes()
    );
    Ok(())
}

/// 只读取并解析索引，不做一致性校验
pub fn read_index(path: &Path) -> Result<ResumeSnapshot, IndexRejection> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(IndexRejection::Missing),
        Err(e) => return Err(IndexRejection::Read(e)),
    };
    let mut reader = BufReader::new(file);

    let mut signature = String::new();
    reader
        .read_line(&mut signature)
        .map_err(IndexRejection::Read)?;
    if signature.trim_end() != INDEX_SIGNATURE {
        return Err(IndexRejection::BadSignature);
    }

    let mut body = String::new();
    reader
        .read_to_string(&mut body)
        .map_err(|e| IndexRejection::Parse(e.to_string()))?;
    serde_json::from_str(&body).map_err(|e| IndexRejection::Parse(e.to_string()))
}

/// 读取索引并逐项校验
///
/// 校验顺序：签名与解析、有效期、文件大小、内容哈希、URL、重定向地址、
/// Range 支持、分片记录、临时文件。
///
/// # Returns
/// - `Ok(ResumeSnapshot)` - 索引可用于续传
/// - `Err(IndexRejection)` - 拒绝原因
pub fn load_index(
    path: &Path,
    expected: &IndexExpectation<'_>,
) -> Result<ResumeSnapshot, IndexRejection> {
    let snapshot = read_index(path)?;

    if let Some(max_age) = expected.max_age {
        let age = chrono::Utc::now().timestamp() - snapshot.update_time;
        if age > 0 && age as u64 > max_age.as_secs() {
            return Err(IndexRejection::Expired {
                age_secs: age as u64,
            });
        }
    }

    let current_size = ResumeSnapshot::size_to_i64(expected.info.size);
    if snapshot.file_size != current_size {
        return Err(IndexRejection::FileSizeChanged {
            persisted: snapshot.file_size,
            current: current_size,
        });
    }

    if expected.check_content_hash
        && !snapshot
            .content_hash
            .eq_ignore_ascii_case(&expected.info.content_hash)
    {
        return Err(IndexRejection::ContentHashChanged);
    }

    if snapshot.url != expected.url {
        return Err(IndexRejection::UrlChanged);
    }

    if expected.check_redirect_url && snapshot.redirect_url != expected.info.redirect_url {
        return Err(IndexRejection::RedirectUrlChanged);
    }

    if !expected.info.accept_ranges && snapshot.persisted_bytes() > 0 {
        return Err(IndexRejection::RangeUnsupported);
    }

    validate_slices(&snapshot)?;
    validate_tmp_file(&snapshot)?;

    Ok(snapshot)
}

/// 删除索引文件
///
/// # Returns
/// - `Ok(true)` - 文件已删除
/// - `Ok(false)` - 文件不存在
pub fn delete_index(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("已删除续传索引: {:?}", path);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// 分片必须从 0 开始首尾相接，只有最后一个分片可以开放结尾
fn validate_slices(snapshot: &ResumeSnapshot) -> Result<(), IndexRejection> {
    let slices = &snapshot.slices;
    if slices.is_empty() {
        return Err(IndexRejection::InvalidSlices("没有分片".to_string()));
    }
    if slices[0].begin != 0 {
        return Err(IndexRejection::InvalidSlices(format!(
            "首个分片起点为 {}",
            slices[0].begin
        )));
    }

    let last = slices.len() - 1;
    for (i, slice) in slices.iter().enumerate() {
        match slice.end() {
            Some(end) => {
                if end < slice.begin || slice.capacity > end - slice.begin + 1 {
                    return Err(IndexRejection::InvalidSlices(format!(
                        "分片 #{} 范围 [{}, {}] 已下载 {}",
                        i, slice.begin, end, slice.capacity
                    )));
                }
                if i < last && slices[i + 1].begin != end + 1 {
                    return Err(IndexRejection::InvalidSlices(format!(
                        "分片 #{} 与下一个分片不连续",
                        i
                    )));
                }
            }
            None if i != last => {
                return Err(IndexRejection::InvalidSlices(format!(
                    "分片 #{} 开放结尾但不是最后一个",
                    i
                )));
            }
            None => {
                if let Some(size) = snapshot.size() {
                    if slice.begin + slice.capacity > size {
                        return Err(IndexRejection::InvalidSlices(format!(
                            "末尾分片已下载 {} 超出文件大小",
                            slice.capacity
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn validate_tmp_file(snapshot: &ResumeSnapshot) -> Result<(), IndexRejection> {
    let path = &snapshot.tmp_file_path;
    if !path.exists() {
        return Err(IndexRejection::TmpFileMissing(path.clone()));
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| IndexRejection::TmpFileNotWritable {
            path: path.clone(),
            source,
        })?;
    let actual = file
        .metadata()
        .map_err(|source| IndexRejection::TmpFileNotWritable {
            path: path.clone(),
            source,
        })?
        .len();

    // 已知大小时临时文件是预分配的；未知大小时至少要覆盖已落盘的数据
    let (expected, ok) = match snapshot.size() {
        Some(size) => (size, actual == size),
        None => {
            let written = snapshot
                .slices
                .iter()
                .map(|s| s.begin + s.capacity)
                .max()
                .unwrap_or(0);
            (written, actual >= written)
        }
    };
    if !ok {
        return Err(IndexRejection::TmpFileSizeMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::types::SliceRecord;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        index_path: PathBuf,
        snapshot: ResumeSnapshot,
        info: ResourceInfo,
    }

    const URL: &str = "http://example.com/a.bin";

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let tmp_path = dir.path().join("a.bin.part");
        let file = File::create(&tmp_path).unwrap();
        file.set_len(300).unwrap();

        let snapshot = ResumeSnapshot {
            update_time: chrono::Utc::now().timestamp(),
            file_size: 300,
            content_hash: "ABCDEF".into(),
            url: URL.into(),
            redirect_url: "http://cdn.example.com/a.bin".into(),
            tmp_file_path: tmp_path,
            slices: vec![
                SliceRecord::new(0, Some(99), 100),
                SliceRecord::new(100, Some(199), 40),
                SliceRecord::new(200, None, 0),
            ],
        };
        let info = ResourceInfo {
            size: Some(300),
            accept_ranges: true,
            content_hash: "abcdef".into(),
            redirect_url: "http://cdn.example.com/a.bin".into(),
        };
        Fixture {
            index_path: dir.path().join("a.bin.resumeindex"),
            _dir: dir,
            snapshot,
            info,
        }
    }

    fn expectation<'a>(info: &'a ResourceInfo) -> IndexExpectation<'a> {
        IndexExpectation {
            url: URL,
            info,
            max_age: None,
            check_content_hash: true,
            check_redirect_url: true,
        }
    }

    #[test]
    fn test_save_and_load() {
        let f = fixture();
        save_index(&f.index_path, &f.snapshot).unwrap();

        let raw = fs::read_to_string(&f.index_path).unwrap();
        assert!(raw.starts_with(INDEX_SIGNATURE));

        let loaded = load_index(&f.index_path, &expectation(&f.info)).unwrap();
        assert_eq!(loaded, f.snapshot);
        assert_eq!(loaded.persisted_bytes(), 140);
    }

    #[test]
    fn test_missing_and_bad_signature() {
        let f = fixture();
        assert!(matches!(
            load_index(&f.index_path, &expectation(&f.info)),
            Err(IndexRejection::Missing)
        ));

        fs::write(&f.index_path, "SOMETHING-ELSE\n{}").unwrap();
        assert!(matches!(
            read_index(&f.index_path),
            Err(IndexRejection::BadSignature)
        ));

        fs::write(&f.index_path, format!("{}\nnot json", INDEX_SIGNATURE)).unwrap();
        assert!(matches!(
            read_index(&f.index_path),
            Err(IndexRejection::Parse(_))
        ));
    }

    #[test]
    fn test_rejections() {
        let f = fixture();
        save_index(&f.index_path, &f.snapshot).unwrap();

        let mut info = f.info.clone();
        info.size = Some(301);
        assert!(matches!(
            load_index(&f.index_path, &expectation(&info)),
            Err(IndexRejection::FileSizeChanged { persisted: 300, current: 301 })
        ));

        let mut info = f.info.clone();
        info.content_hash = "123456".into();
        assert!(matches!(
            load_index(&f.index_path, &expectation(&info)),
            Err(IndexRejection::ContentHashChanged)
        ));
        let mut relaxed = expectation(&info);
        relaxed.check_content_hash = false;
        assert!(load_index(&f.index_path, &relaxed).is_ok());

        let mut other_url = expectation(&f.info);
        other_url.url = "http://example.com/b.bin";
        assert!(matches!(
            load_index(&f.index_path, &other_url),
            Err(IndexRejection::UrlChanged)
        ));

        let mut info = f.info.clone();
        info.redirect_url = "http://other.example.com/a.bin".into();
        assert!(matches!(
            load_index(&f.index_path, &expectation(&info)),
            Err(IndexRejection::RedirectUrlChanged)
        ));

        let mut info = f.info.clone();
        info.accept_ranges = false;
        assert!(matches!(
            load_index(&f.index_path, &expectation(&info)),
            Err(IndexRejection::RangeUnsupported)
        ));
    }

    #[test]
    fn test_expired() {
        let mut f = fixture();
        f.snapshot.update_time -= 3600;
        save_index(&f.index_path, &f.snapshot).unwrap();

        let mut exp = expectation(&f.info);
        exp.max_age = Some(Duration::from_secs(60));
        assert!(matches!(
            load_index(&f.index_path, &exp),
            Err(IndexRejection::Expired { .. })
        ));

        exp.max_age = Some(Duration::from_secs(7200));
        assert!(load_index(&f.index_path, &exp).is_ok());
    }

    #[test]
    fn test_tmp_file_checks() {
        let f = fixture();
        save_index(&f.index_path, &f.snapshot).unwrap();

        File::options()
            .write(true)
            .open(&f.snapshot.tmp_file_path)
            .unwrap()
            .set_len(10)
            .unwrap();
        assert!(matches!(
            load_index(&f.index_path, &expectation(&f.info)),
            Err(IndexRejection::TmpFileSizeMismatch { expected: 300, actual: 10 })
        ));

        fs::remove_file(&f.snapshot.tmp_file_path).unwrap();
        assert!(matches!(
            load_index(&f.index_path, &expectation(&f.info)),
            Err(IndexRejection::TmpFileMissing(_))
        ));
    }

    #[test]
    fn test_invalid_slices() {
        let mut f = fixture();
        f.snapshot.slices[1].begin = 150;
        save_index(&f.index_path, &f.snapshot).unwrap();
        assert!(matches!(
            load_index(&f.index_path, &expectation(&f.info)),
            Err(IndexRejection::InvalidSlices(_))
        ));

        f.snapshot.slices = vec![SliceRecord::new(0, None, 0), SliceRecord::new(10, None, 0)];
        save_index(&f.index_path, &f.snapshot).unwrap();
        assert!(matches!(
            load_index(&f.index_path, &expectation(&f.info)),
            Err(IndexRejection::InvalidSlices(_))
        ));
    }

    #[test]
    fn test_delete_index() {
        let f = fixture();
        assert!(!delete_index(&f.index_path).unwrap());
        save_index(&f.index_path, &f.snapshot).unwrap();
        assert!(delete_index(&f.index_path).unwrap());
        assert!(!f.index_path.exists());
    }
}
