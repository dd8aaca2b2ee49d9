//! Shared graph builders for the session integration tests.

use cinnabar_core::{
    AttributeValue, DataType, Graph, Node, TensorInfo, TensorKind, TensorShape,
};

/// Add a tensor with a static shape to the graph.
pub fn add_tensor(
    graph: &mut Graph,
    name: &str,
    dtype: DataType,
    shape: &[usize],
    kind: TensorKind,
) {
    graph.add_tensor(TensorInfo {
        name: name.to_string(),
        dtype,
        shape: TensorShape::Static(shape.to_vec()),
        kind,
        initializer: None,
    });
}

/// Single-node pooling graph: x -> OpType -> y (and optionally indices).
pub fn pool_graph(
    op_type: &str,
    opset: i64,
    attributes: Vec<(&str, AttributeValue)>,
    input_shape: &[usize],
    output_shape: &[usize],
    with_indices: bool,
) -> Graph {
    let mut graph = Graph::new();
    graph.opset_imports.insert(String::new(), opset);

    add_tensor(&mut graph, "x", DataType::F32, input_shape, TensorKind::Input);
    add_tensor(&mut graph, "y", DataType::F32, output_shape, TensorKind::Output);

    let mut node = Node::new(op_type);
    node.name = format!("{}_node", op_type.to_lowercase());
    node.inputs = vec!["x".to_string()];
    node.outputs = vec!["y".to_string()];
    if with_indices {
        add_tensor(
            &mut graph,
            "indices",
            DataType::I64,
            output_shape,
            TensorKind::Output,
        );
        node.outputs.push("indices".to_string());
    }
    for (name, value) in attributes {
        node.attributes.insert(name.to_string(), value);
    }
    graph.add_node(node);

    graph.inputs = vec!["x".to_string()];
    graph.outputs = vec!["y".to_string()];
    if with_indices {
        graph.outputs.push("indices".to_string());
    }
    graph
}

/// Single-node layer-normalization graph with a scale initializer.
pub fn layer_norm_graph(
    op_type: &str,
    opset: i64,
    shape: &[usize],
    scale: &[f32],
    with_stats: bool,
) -> Graph {
    let mut graph = Graph::new();
    graph.opset_imports.insert(String::new(), opset);

    add_tensor(&mut graph, "x", DataType::F32, shape, TensorKind::Input);
    graph.add_tensor(TensorInfo {
        name: "scale".to_string(),
        dtype: DataType::F32,
        shape: TensorShape::Static(vec![scale.len()]),
        kind: TensorKind::Initializer,
        initializer: Some(scale.iter().flat_map(|v| v.to_le_bytes()).collect()),
    });
    add_tensor(&mut graph, "y", DataType::F32, shape, TensorKind::Output);

    let mut node = Node::new(op_type);
    node.name = "norm_node".to_string();
    node.inputs = vec!["x".to_string(), "scale".to_string()];
    node.outputs = vec!["y".to_string()];
    node.attributes
        .insert("epsilon".to_string(), AttributeValue::Float(1e-5));
    if with_stats {
        let mut stat_shape = vec![shape[0]];
        stat_shape.extend(std::iter::repeat(1).take(shape.len() - 1));
        add_tensor(&mut graph, "mean", DataType::F32, &stat_shape, TensorKind::Output);
        add_tensor(
            &mut graph,
            "inv_std_dev",
            DataType::F32,
            &stat_shape,
            TensorKind::Output,
        );
        node.outputs.push("mean".to_string());
        node.outputs.push("inv_std_dev".to_string());
    }
    graph.add_node(node);

    graph.inputs = vec!["x".to_string()];
    graph.outputs = vec!["y".to_string()];
    if with_stats {
        graph.outputs.push("mean".to_string());
        graph.outputs.push("inv_std_dev".to_string());
    }
    graph
}
