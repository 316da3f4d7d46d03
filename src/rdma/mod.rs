// RDMA completion queues.
pub mod cq;

// Endpoint GIDs.
pub mod gid;

// Local RDMA memory regions.
pub mod mr;

// RDMA protection domains.
pub mod pd;

// RDMA queue pairs.
pub mod qp;

// Remote RDMA memory regions.
pub mod remote_mem;

// Type aliases, path MTUs and PSN arithmetic.
pub mod types;

// RDMA work requests.
pub mod wr;
