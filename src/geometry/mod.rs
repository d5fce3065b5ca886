pub mod delaunay;
pub mod half_edge_mesh;
pub mod interface_mesh;
pub mod tracing;
