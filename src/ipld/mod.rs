//! Content addressing and Merkle-DAG linking

pub mod cid;
pub mod dag;

pub use cid::{
    create_cid, create_raw_cid, is_cid_equal, parse_cid, Cid, CidError, CidInput, Codec,
    ParsedCid,
};
pub use dag::{
    create_directory_node, create_file_dag, create_node, deserialize_node, serialize_node,
    DagError, DagNode, FileDag, Links,
};
