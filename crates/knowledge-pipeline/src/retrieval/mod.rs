//! Retrieval: hit testing over embedded chunks

mod hit_test;
pub mod similarity;

pub use hit_test::RetrievalEngine;
pub use similarity::cosine_similarity;
