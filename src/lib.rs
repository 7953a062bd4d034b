pub mod chunk;
pub mod config;
pub mod heap;
pub mod index;
pub mod kmer;
pub mod phenotype;
pub mod pipeline;
pub mod plink;
pub mod score;
pub mod store;
pub mod types;
pub mod universe;
