//! 续传持久化模块
//!
//! 下载过程中定期把分片进度写入目标文件旁的 `.resumeindex`，
//! 下次启动时校验通过即可从断点继续。
//!
//! ## 文件结构
//!
//! ```text
//! downloads/
//! ├── a.iso.part          # 预分配的临时文件
//! └── a.iso.resumeindex   # 续传索引（签名行 + JSON）
//! ```

pub mod index;
pub mod types;

pub use index::{
    delete_index, load_index, read_index, save_index, IndexExpectation, IndexRejection,
    INDEX_SIGNATURE,
};
pub use types::{ResumeSnapshot, SliceRecord};
