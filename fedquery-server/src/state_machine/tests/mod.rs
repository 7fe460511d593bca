mod linkage_batch;
mod utils;
