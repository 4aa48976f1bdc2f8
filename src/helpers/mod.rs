pub mod header_list;
pub mod traits;

pub use header_list::HeaderList;
