use super::dto::ProcessDto;
use crate::error::GraphError;

/// Parse a YAML string into a ProcessDto.
///
/// Only the document shape is checked here; `ProcessDto::into_graph()`
/// resolves references and deployment validates semantics.
pub fn parse_process_yaml(yaml_str: &str) -> Result<ProcessDto, GraphError> {
    serde_yaml::from_str(yaml_str).map_err(|e| GraphError::Parse(e.to_string()))
}
