use crate::lookup::find_by_name_or_id;
use crate::ProviderError;
use serde::{Deserialize, Serialize};
use unikit_schema::{
    CreateVolumeParams, Image, Instance, PullImageParams, PushImageParams,
    RemoteDeleteImageParams, RunInstanceParams, StageImageParams, Volume,
};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Whether compiled images for this backend carry a partition table.
    pub use_partition_tables: bool,
}

/// The lifecycle contract every backend implements.
///
/// Mutating operations follow one shape: read current ledger state,
/// validate, perform the backend side effect, and only then mutate the
/// ledger. A failed side effect leaves the ledger untouched.
///
/// `List*` is the synchronization point with the backend authority; `Get*`
/// resolves a name or id against the reconciled listing.
pub trait Provider: Send + Sync {
    /// Registry name of this backend instance.
    fn name(&self) -> &str;

    fn config(&self) -> ProviderConfig;

    fn stage(&self, params: &StageImageParams) -> Result<Image, ProviderError>;

    fn list_images(&self) -> Result<Vec<Image>, ProviderError>;

    fn get_image(&self, name_or_id: &str) -> Result<Image, ProviderError> {
        find_by_name_or_id(self.list_images()?, name_or_id)
    }

    fn delete_image(&self, id: &str, force: bool) -> Result<(), ProviderError>;

    fn run_instance(&self, params: &RunInstanceParams) -> Result<Instance, ProviderError>;

    fn list_instances(&self) -> Result<Vec<Instance>, ProviderError>;

    fn get_instance(&self, name_or_id: &str) -> Result<Instance, ProviderError> {
        find_by_name_or_id(self.list_instances()?, name_or_id)
    }

    fn delete_instance(&self, id: &str, force: bool) -> Result<(), ProviderError>;

    fn start_instance(&self, id: &str) -> Result<(), ProviderError>;

    fn stop_instance(&self, id: &str) -> Result<(), ProviderError>;

    fn get_instance_logs(&self, id: &str) -> Result<String, ProviderError>;

    fn create_volume(&self, params: &CreateVolumeParams) -> Result<Volume, ProviderError>;

    fn list_volumes(&self) -> Result<Vec<Volume>, ProviderError>;

    fn get_volume(&self, name_or_id: &str) -> Result<Volume, ProviderError> {
        find_by_name_or_id(self.list_volumes()?, name_or_id)
    }

    fn delete_volume(&self, id: &str, force: bool) -> Result<(), ProviderError>;

    fn attach_volume(
        &self,
        id: &str,
        instance_id: &str,
        mount_point: &str,
    ) -> Result<(), ProviderError>;

    fn detach_volume(&self, id: &str) -> Result<(), ProviderError>;

    fn pull_image(&self, _params: &PullImageParams) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported {
            op: "pull image",
            backend: self.name().to_owned(),
        })
    }

    fn push_image(&self, _params: &PushImageParams) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported {
            op: "push image",
            backend: self.name().to_owned(),
        })
    }

    fn remote_delete_image(&self, _params: &RemoteDeleteImageParams) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported {
            op: "remote delete image",
            backend: self.name().to_owned(),
        })
    }
}

/// Sort a listing for stable output.
pub(crate) fn sorted<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_by_key(key);
    items
}
