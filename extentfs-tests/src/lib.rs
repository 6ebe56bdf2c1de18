//! Test support for the extentfs client data plane: an in-process mock
//! cluster shared by the library's integration tests and the workload
//! runner binary.

pub mod mock;
