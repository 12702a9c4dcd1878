//! Document intake: upload validation and local text splitting

mod chunker;
mod validation;

pub use chunker::{contains_blocked_term, extract_image_references, TextChunker};
pub use validation::{
    check_file_type, check_size, check_supported, count_characters, file_extension,
    validate_node_name,
};
