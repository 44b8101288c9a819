#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No run of free pages is large enough for the request.
    NoMemory(usize),
    /// Freed pointer does not fall inside the pool's data pages.
    OutsidePool(usize),
    /// Freed pointer is not aligned to its object size.
    WrongChunk(usize),
    /// The object's occupancy bit is already clear.
    AlreadyFree(usize),
    /// Freed pointer names an interior page of a multi-page run.
    WrongPage(usize),
    /// Region cannot hold the control tables plus at least one data page.
    RegionTooSmall(usize),
    /// Region base is not aligned to the pool page size.
    UnalignedRegion(usize),
    /// Rejected pool geometry (page size, shifts).
    InvalidConfig(&'static str),
    /// Attached region does not carry an initialized pool.
    NotAPool,
    /// Operating system call failed, with errno.
    Sys(&'static str, i32),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NoMemory(size) => write!(f, "failed to allocate {size} bytes, no memory"),
            Error::OutsidePool(addr) => write!(f, "pointer {addr:#x} is outside of pool"),
            Error::WrongChunk(addr) => write!(f, "pointer {addr:#x} points to wrong chunk"),
            Error::AlreadyFree(addr) => write!(f, "chunk {addr:#x} is already free"),
            Error::WrongPage(addr) => write!(f, "pointer {addr:#x} points to wrong page"),
            Error::RegionTooSmall(len) => write!(f, "region of {len} bytes is too small"),
            Error::UnalignedRegion(addr) => write!(f, "region base {addr:#x} is not page aligned"),
            Error::InvalidConfig(what) => write!(f, "invalid pool configuration: {what}"),
            Error::NotAPool => write!(f, "region does not contain an initialized pool"),
            Error::Sys(call, errno) => write!(f, "{call} failed with errno {errno}"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
