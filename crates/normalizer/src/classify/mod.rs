mod kpved;
mod okpd2;

pub use kpved::{KpvedClassifier, KpvedResult, DEFAULT_CONFIDENCE_DELTA};
pub use okpd2::{Okpd2Classifier, Okpd2Result, BIND_CUTOFF};
