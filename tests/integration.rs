//! Integration test harness.

mod integration {
    mod broadcast_pipeline_test;
}
