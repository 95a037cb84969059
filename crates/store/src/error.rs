use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store CLI invocation failed: {0}")]
    CliExec(std::io::Error),
    #[error("store CLI exited with status {0}: {1}")]
    CliStatus(i32, String),
    #[error("store HTTP transaction failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("malformed row from store CLI: {0}")]
    MalformedRow(String),
    #[error(
        "refusing to write row owned by {owner:?}: caller is {self_id:?} and this statement is not on the GC exception list"
    )]
    NotOwner {
        self_id: String,
        owner: Option<String>,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;
