/// Maps a PVC name to the name of the Deployment consuming it
#[derive(Clone, Debug)]
pub struct NameResolver {
    suffix: String,
}

impl Default for NameResolver {
    fn default() -> Self {
        Self::new("-pvc")
    }
}

impl NameResolver {
    pub fn new(suffix: &str) -> Self {
        Self {
            suffix: suffix.to_string(),
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Strips the trailing suffix once. Names without it are returned as-is.
    pub fn deployment_name_for(&self, pvc_name: &str) -> String {
        pvc_name
            .strip_suffix(self.suffix.as_str())
            .filter(|n| !n.is_empty())
            .unwrap_or(pvc_name)
            .to_string()
    }
}
