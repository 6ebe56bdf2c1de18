//! Shared mock-cluster support, provided by the `extentfs-tests` member so
//! the integration tests and the workload runner drive one implementation.

pub use extentfs_tests::mock::{MockCluster, test_config};
