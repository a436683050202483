mod monitor_test;
mod pipeline_test;
mod pool_test;
mod state_test;
