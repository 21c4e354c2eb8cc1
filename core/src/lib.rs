pub mod device;
pub mod error;

pub use device::{BlockDevice, FileDevice, InMemoryDevice};
pub use error::{NtfsError, NtfsResult};
