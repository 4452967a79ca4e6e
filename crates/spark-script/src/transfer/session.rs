use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use memmap2::Mmap;

use crate::error::{FileOp, Result, RuntimeError};
use crate::native::{ConnectionId, WriteStatus};
use crate::response::ResponseHandle;

use super::TransferStrategy;

/// 一次推送的结局。
pub(super) enum PumpOutcome {
    /// 发送缓冲已满，等待下一次可写通知。
    Pending,
    Completed,
    Failed(RuntimeError),
}

enum Source {
    Buffered {
        file: File,
        buffer: Vec<u8>,
        /// 缓冲中已读出但尚未被接收的字节数；非零即为挂起块。
        pending: usize,
    },
    Mapped {
        map: Mmap,
    },
}

/// 流式传输会话。
pub(super) struct TransferSession {
    response: ResponseHandle,
    path: PathBuf,
    source: Source,
    chunk_size: usize,
    offset: u64,
    remaining: u64,
    started: Instant,
}

impl TransferSession {
    pub(super) fn open(
        response: ResponseHandle,
        path: &Path,
        size: u64,
        strategy: TransferStrategy,
        chunk_size: usize,
        started: Instant,
    ) -> Result<Self> {
        let file = File::open(path).map_err(|err| RuntimeError::io(FileOp::Open, path, err))?;
        let source = match strategy {
            TransferStrategy::Mapped => Source::Mapped {
                map: map_file(&file, path)?,
            },
            TransferStrategy::Buffered | TransferStrategy::Inline => Source::Buffered {
                file,
                buffer: vec![0; chunk_size],
                pending: 0,
            },
        };
        Ok(Self {
            response,
            path: path.to_path_buf(),
            source,
            chunk_size,
            offset: 0,
            remaining: size,
            started,
        })
    }

    pub(super) fn conn(&self) -> ConnectionId {
        self.response.conn()
    }

    pub(super) fn response(&self) -> &ResponseHandle {
        &self.response
    }

    pub(super) fn path(&self) -> &Path {
        &self.path
    }

    pub(super) fn started(&self) -> Instant {
        self.started
    }

    pub(super) fn sent(&self) -> u64 {
        self.offset
    }

    /// 尽可能多地写出分块，直到完成、背压或失败。
    pub(super) fn pump(&mut self) -> PumpOutcome {
        loop {
            if self.remaining == 0 {
                return match self.response.end(&[]) {
                    Ok(()) => PumpOutcome::Completed,
                    Err(err) => PumpOutcome::Failed(err),
                };
            }
            let want = self.remaining.min(self.chunk_size as u64) as usize;
            let status = match &mut self.source {
                Source::Buffered {
                    file,
                    buffer,
                    pending,
                } => {
                    if *pending == 0 {
                        if let Err(err) = file.read_exact(&mut buffer[..want]) {
                            return PumpOutcome::Failed(RuntimeError::io(
                                FileOp::Read,
                                &self.path,
                                err,
                            ));
                        }
                        *pending = want;
                    }
                    self.response.write(&buffer[..*pending])
                }
                Source::Mapped { map } => {
                    let start = self.offset as usize;
                    match map.get(start..start + want) {
                        Some(chunk) => self.response.write(chunk),
                        None => {
                            return PumpOutcome::Failed(RuntimeError::io(
                                FileOp::Map,
                                &self.path,
                                std::io::Error::new(
                                    std::io::ErrorKind::UnexpectedEof,
                                    "file shrank while mapped",
                                ),
                            ));
                        }
                    }
                }
            };

            match status {
                Ok(WriteStatus::Written) => {
                    let written = match &mut self.source {
                        Source::Buffered { pending, .. } => std::mem::take(pending),
                        Source::Mapped { .. } => want,
                    } as u64;
                    self.offset += written;
                    self.remaining -= written;
                }
                Ok(WriteStatus::Full) => return PumpOutcome::Pending,
                Err(err) => return PumpOutcome::Failed(err),
            }
        }
    }
}

#[allow(unsafe_code)]
fn map_file(file: &File, path: &Path) -> Result<Mmap> {
    // SAFETY: 映射只读，且与会话同生命周期。外部进程在传输期间截断文件会让访问触发 SIGBUS，
    // 这是内存映射发送的已知限制；静态目录应视为只读部署产物。
    unsafe { Mmap::map(file) }.map_err(|err| RuntimeError::io(FileOp::Map, path, err))
}
