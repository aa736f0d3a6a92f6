//! Generated wire types and gRPC stubs, compiled by `build.rs` from
//! `proto/ydb.proto`. Treated as the opaque serialization collaborator
//! spec.md section 1 carves out of scope — nothing in this module is
//! hand-written.

tonic::include_proto!("ydb.v1");
