#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("block: {0}")]
    Block(BlockError),
    #[error("fs: {0}")]
    Fs(FsError),
}

/// Failures raised by the block-device layer (C2).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    #[error("command timed out waiting for completion")]
    CmdTimeout,
    #[error("controller raised an error bit on command response")]
    CmdError,
    #[error("data transfer timed out")]
    DataTimeout,
    #[error("data transfer raised an error bit")]
    DataError,
    #[error("unexpected response from card")]
    Protocol,
    #[error("ready-wait exhausted, card still busy")]
    Busy,
    #[error("driver used before init()")]
    NotInitialized,
}

/// Bring-up failures distinguished during `mount`, per spec §7.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountError {
    #[error("sector 0 is neither a 512-byte-sector BPB nor a usable MBR")]
    NoBpbAtSectorZero,
    #[error("MBR first partition entry is empty")]
    PartitionEmpty,
    #[error("BPB fields are inconsistent")]
    InvalidBpb,
}

/// Failures raised by the filesystem layer (C3/C4).
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("io: {0}")]
    Io(BlockError),
    #[error("mount: {0}")]
    Mount(MountError),
    #[error("path component did not resolve")]
    NotFound,
    #[error("no free cluster or directory slot, and parent could not be extended")]
    NoSpace,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("handle used without prior open/create")]
    InvalidHandle,
    #[error("FAT chain loop or reserved cluster reached")]
    Corrupt,
}

impl From<BlockError> for Error {
    fn from(e: BlockError) -> Self {
        Error::Block(e)
    }
}

impl From<FsError> for Error {
    fn from(e: FsError) -> Self {
        Error::Fs(e)
    }
}

impl From<BlockError> for FsError {
    fn from(e: BlockError) -> Self {
        FsError::Io(e)
    }
}

impl From<MountError> for FsError {
    fn from(e: MountError) -> Self {
        FsError::Mount(e)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
