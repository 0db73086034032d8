pub mod sink;
pub mod transport;

pub use sink::{CsvSink, FileSinks, JsonlSink, LinksFileSink};
pub use transport::ReqwestTransport;
