mod repo_file;
mod repo_mem;

pub use repo_file::FileRecordRepository;
pub use repo_mem::InMemoryRecordRepository;
