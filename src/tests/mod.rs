mod runtime;

mod test_common_validation;
mod test_memory_store;
