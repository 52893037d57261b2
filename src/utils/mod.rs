mod io;
mod other;

pub use io::{ByteReader, ByteWriter, DbFile, Decodeable, Encodeable};
pub use other::{init_log, lock_state, HandyRwLock};
