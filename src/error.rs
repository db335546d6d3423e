use thiserror::Error;

/// Opaque error carried through from an external classifier implementation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum SpatialError {
    #[error("invalid coordinate: lat {lat}, lon {lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },
    #[error("invalid hex resolution {0}, expected 0..=15")]
    InvalidResolution(u8),
    #[error("field '{0}' missing from aggregate record")]
    MissingField(String),
    #[error("nearest-reference lookup requested against an empty reference set")]
    EmptyReferenceSet,
    #[error("classifier failure: {0}")]
    Classifier(BoxError),
    #[error("csv export failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
