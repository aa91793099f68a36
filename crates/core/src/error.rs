use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Segmentation {0} cannot be compared with itself")]
    SelfComparison(String),

    #[error("Evaluation record does not describe pair {0}")]
    RecordMismatch(String),

    #[error("Segmentation {0} is not a selectable option")]
    NotSelectable(String),

    #[error("Unexpected response shape: {0}")]
    UnexpectedShape(String),
}
