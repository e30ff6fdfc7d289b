//! Parsing of `projects/P/locations/L/clusters/C/instances/I` instance identifiers.

use crate::error::ConnectorError;

/// The four path components that identify a managed instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceUri {
    pub project: String,
    pub location: String,
    pub cluster: String,
    pub instance: String,
}

impl InstanceUri {
    pub fn parse(uri: &str) -> Result<Self, ConnectorError> {
        let parts: Vec<&str> = uri.split('/').collect();
        let invalid = || {
            ConnectorError::InvalidArgument(format!(
                "Invalid instance connection uri '{}', expected projects/<PROJECT>/locations/<LOCATION>/clusters/<CLUSTER>/instances/<INSTANCE>.",
                uri
            ))
        };

        if parts.len() != 8 {
            return Err(invalid());
        }
        if parts[0] != "projects" || parts[2] != "locations" || parts[4] != "clusters" || parts[6] != "instances"
        {
            return Err(invalid());
        }
        let (project, location, cluster, instance) = (parts[1], parts[3], parts[5], parts[7]);
        if [project, location, cluster, instance].iter().any(|p| p.is_empty()) {
            return Err(invalid());
        }

        Ok(InstanceUri {
            project: project.to_string(),
            location: location.to_string(),
            cluster: cluster.to_string(),
            instance: instance.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_uri() {
        let parsed =
            InstanceUri::parse("projects/my-project/locations/us-central1/clusters/my-cluster/instances/my-instance")
                .unwrap();
        assert_eq!(parsed.project, "my-project");
        assert_eq!(parsed.location, "us-central1");
        assert_eq!(parsed.cluster, "my-cluster");
        assert_eq!(parsed.instance, "my-instance");
    }

    #[test]
    fn rejects_missing_segments() {
        assert!(InstanceUri::parse("projects/my-project/locations/us-central1").is_err());
    }

    #[test]
    fn rejects_wrong_literal_segments() {
        assert!(InstanceUri::parse(
            "projects/my-project/regions/us-central1/clusters/my-cluster/instances/my-instance"
        )
        .is_err());
    }

    #[test]
    fn rejects_empty_component() {
        assert!(InstanceUri::parse("projects//locations/us-central1/clusters/my-cluster/instances/my-instance").is_err());
    }
}
