use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not open the index")]
    Open,
    #[display("invalid exclusions")]
    Exclusions,
    #[display("indexing failed")]
    Index,
    #[display("query failed")]
    Query,
    #[display("could not write output")]
    Output,
}
