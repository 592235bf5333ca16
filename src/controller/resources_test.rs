//! Unit tests for shared resource helpers.

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::Service;
    use kube::api::{Api, ObjectMeta};
    use kube::Client;

    use crate::controller::resources::{
        apply_object, owner_reference, standard_labels, COMPONENT_LABEL, MANAGED_BY_LABEL,
        PART_OF_LABEL, VERSION_LABEL,
    };
    use crate::error::Error;

    // -----------------------------------------------------------------------
    // standard_labels
    // -----------------------------------------------------------------------

    #[test]
    fn test_standard_labels_without_part_of() {
        let labels = standard_labels("ssp-operator-services", "service-controller", None);

        assert_eq!(labels.len(), 3);
        assert_eq!(labels[MANAGED_BY_LABEL], "ssp-operator-services");
        assert_eq!(labels[COMPONENT_LABEL], "service-controller");
        assert_eq!(labels[VERSION_LABEL], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_standard_labels_with_part_of() {
        let labels = standard_labels("ssp-operator-services", "service-controller", Some("kubevirt"));
        assert_eq!(labels[PART_OF_LABEL], "kubevirt");

        let empty = standard_labels("ssp-operator-services", "service-controller", Some(""));
        assert!(!empty.contains_key(PART_OF_LABEL));
    }

    // -----------------------------------------------------------------------
    // owner_reference
    // -----------------------------------------------------------------------

    #[test]
    fn test_owner_reference_points_at_deployment() {
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("ssp-operator".to_string()),
                namespace: Some("kubevirt".to_string()),
                uid: Some("6f1c9d2e-0000-4000-8000-000000000001".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let owner = owner_reference(&deployment);

        assert_eq!(owner.api_version, "apps/v1");
        assert_eq!(owner.kind, "Deployment");
        assert_eq!(owner.name, "ssp-operator");
        assert_eq!(owner.uid, "6f1c9d2e-0000-4000-8000-000000000001");
        assert_eq!(owner.controller, None);
    }

    // -----------------------------------------------------------------------
    // apply_object
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_apply_object_requires_a_name() {
        let config = kube::Config::new("http://127.0.0.1:6443".parse().unwrap());
        let api: Api<Service> = Api::namespaced(Client::try_from(config).unwrap(), "kubevirt");

        let result = apply_object(&api, &Service::default()).await;

        assert!(matches!(result, Err(Error::ConfigError(_))));
    }
}
