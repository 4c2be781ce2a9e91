pub mod pod_resources;

pub use pod_resources::KubeletPodResources;
pub use pod_resources::PodResourcesError;
pub use pod_resources::PodResourcesSource;
