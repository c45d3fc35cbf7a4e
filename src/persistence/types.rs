//! 续传索引数据结构

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 续传索引快照
///
/// `file_size` 为 -1 表示文件大小未知；分片 `end` 为 -1 表示开放结尾（读到连接关闭）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeSnapshot {
    /// 写入时间（Unix 秒）
    pub update_time: i64,
    pub file_size: i64,
    /// 服务器内容哈希，没有则为空串
    #[serde(default)]
    pub content_hash: String,
    pub url: String,
    #[serde(default)]
    pub redirect_url: String,
    /// 临时文件路径
    pub tmp_file_path: PathBuf,
    pub slices: Vec<SliceRecord>,
}

/// 单个分片的持久化记录，`capacity` 只计已落盘的字节
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceRecord {
    pub begin: u64,
    pub end: i64,
    pub capacity: u64,
}

impl SliceRecord {
    pub fn new(begin: u64, end: Option<u64>, capacity: u64) -> Self {
        Self {
            begin,
            end: end.map(|e| e as i64).unwrap_or(-1),
            capacity,
        }
    }

    /// 结束偏移，开放结尾返回 None
    pub fn end(&self) -> Option<u64> {
        (self.end >= 0).then_some(self.end as u64)
    }
}

impl ResumeSnapshot {
    /// 文件大小，未知返回 None
    pub fn size(&self) -> Option<u64> {
        (self.file_size >= 0).then_some(self.file_size as u64)
    }

    pub fn size_to_i64(size: Option<u64>) -> i64 {
        size.map(|s| s as i64).unwrap_or(-1)
    }

    /// 已落盘字节总数
    pub fn persisted_bytes(&self) -> u64 {
        self.slices.iter().map(|s| s.capacity).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_end_encoding() {
        let open = SliceRecord::new(100, None, 5);
        assert_eq!(open.end, -1);
        assert_eq!(open.end(), None);

        let bounded = SliceRecord::new(0, Some(99), 100);
        assert_eq!(bounded.end(), Some(99));
    }

    #[test]
    fn test_unknown_size() {
        assert_eq!(ResumeSnapshot::size_to_i64(None), -1);
        assert_eq!(ResumeSnapshot::size_to_i64(Some(42)), 42);
    }
}
