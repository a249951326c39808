//! Unit tests for ServiceBuild reconciler

#[cfg(test)]
mod tests {
    use crate::reconciler::Reconciler;
    use crate::reconciler::service_build::{
        Progress, classify, failed_message, service_builds_referencing,
    };
    use crate::test_utils::*;
    use crds::{
        BuildState, ComponentBuild, ComponentBuildFailureInfo, ComponentBuildState,
        ComponentBuildStatus, ServiceBuild, ServiceBuildComponentInfo, definition_hash,
    };
    use std::collections::BTreeSet;

    const NS: &str = INTERNAL_NAMESPACE;

    fn service_build(cluster: &FakeCluster, name: &str) -> ServiceBuild {
        cluster.service_builds.object(NS, name).unwrap()
    }

    async fn reconcile(cluster: &mut FakeCluster, reconciler: &Reconciler, name: &str) {
        cluster.sync();
        let build = service_build(cluster, name);
        reconciler.reconcile_service_build(&build).await.unwrap();
    }

    fn set_child_state(cluster: &FakeCluster, name: &str, state: ComponentBuildState) {
        cluster.component_builds.update(NS, name, |build| {
            build.status = Some(ComponentBuildStatus {
                state,
                ..Default::default()
            });
        });
    }

    fn info(build_name: Option<&str>, state: Option<ComponentBuildState>) -> ServiceBuildComponentInfo {
        ServiceBuildComponentInfo {
            build_name: build_name.map(str::to_string),
            build_state: state,
            ..Default::default()
        }
    }

    #[test]
    fn test_classify() {
        let mut build = test_service_build("sb", NS, &[]);
        let none = BTreeSet::new();
        assert_eq!(classify(&build.spec, &none), Progress::AllChildrenSucceeded);

        build.spec.components.insert(
            "b".to_string(),
            info(Some("cb-b"), Some(ComponentBuildState::Running)),
        );
        assert_eq!(
            classify(&build.spec, &none),
            Progress::HasActiveChildren(vec!["b".to_string()])
        );

        build.spec.components.insert("c".to_string(), info(None, None));
        assert_eq!(
            classify(&build.spec, &none),
            Progress::NeedsNewChildren(vec!["c".to_string()])
        );

        build.spec.components.insert(
            "a".to_string(),
            info(Some("cb-a"), Some(ComponentBuildState::Failed)),
        );
        assert_eq!(
            classify(&build.spec, &none),
            Progress::HasFailedChildren(vec!["a".to_string()])
        );
    }

    #[test]
    fn test_uncached_children_are_active() {
        let mut build = test_service_build("sb", NS, &[]);
        build.spec.components.insert(
            "a".to_string(),
            info(Some("cb-a"), Some(ComponentBuildState::Succeeded)),
        );
        let uncached = BTreeSet::from(["a".to_string()]);
        assert_eq!(
            classify(&build.spec, &uncached),
            Progress::HasActiveChildren(vec!["a".to_string()])
        );
    }

    #[test]
    fn test_failed_message_hides_internal_errors() {
        let mut build = test_service_build("sb", NS, &[]);
        let mut user = info(Some("cb-a"), Some(ComponentBuildState::Failed));
        user.failure_info = Some(ComponentBuildFailureInfo {
            message: "npm ERR! missing script: build".to_string(),
            internal: false,
        });
        let mut internal = info(Some("cb-b"), Some(ComponentBuildState::Failed));
        internal.failure_info = Some(ComponentBuildFailureInfo {
            message: "docker daemon unreachable".to_string(),
            internal: true,
        });
        build.spec.components.insert("a".to_string(), user);
        build.spec.components.insert("b".to_string(), internal);
        build.spec.components.insert(
            "c".to_string(),
            info(Some("cb-c"), Some(ComponentBuildState::Failed)),
        );

        let message = failed_message(
            &build.spec,
            &["a".to_string(), "b".to_string(), "c".to_string()],
        );
        assert_eq!(
            message,
            "the following components failed to build: a (npm ERR! missing script: build), \
             b (failed due to an internal error), c"
        );
    }

    #[tokio::test]
    async fn test_creates_component_builds() {
        let mut cluster = FakeCluster::new();
        cluster.service_builds.seed(test_service_build(
            "sb",
            NS,
            &[
                ("api", test_build_definition("c1")),
                ("worker", test_build_definition("c2")),
            ],
        ));
        let reconciler = cluster.reconciler();
        reconcile(&mut cluster, &reconciler, "sb").await;

        let builds: Vec<ComponentBuild> = cluster.component_builds.objects();
        assert_eq!(builds.len(), 2);

        let sb = service_build(&cluster, "sb");
        let api = &sb.spec.components["api"];
        let hash = definition_hash(&test_build_definition("c1")).unwrap();
        assert_eq!(api.definition_hash.as_deref(), Some(hash.as_str()));
        let child = cluster
            .component_builds
            .object(NS, api.build_name.as_deref().unwrap())
            .unwrap();
        assert_eq!(child.definition_hash(), Some(hash.as_str()));
        assert!(uuid::Uuid::parse_str(child.metadata.name.as_deref().unwrap()).is_ok());
        assert_eq!(
            reconciler.recent_builds.get(NS, &hash).await,
            child.metadata.name.clone()
        );

        let status = sb.status.unwrap();
        assert_eq!(status.state, BuildState::Running);
        assert_eq!(
            status.message.as_deref(),
            Some("the following components are still building: api, worker")
        );
    }

    #[tokio::test]
    async fn test_identical_components_share_a_build() {
        let mut cluster = FakeCluster::new();
        cluster.service_builds.seed(test_service_build(
            "sb",
            NS,
            &[
                ("api", test_build_definition("c1")),
                ("worker", test_build_definition("c1")),
            ],
        ));
        let reconciler = cluster.reconciler();
        reconcile(&mut cluster, &reconciler, "sb").await;

        assert_eq!(cluster.component_builds.objects().len(), 1);
        let sb = service_build(&cluster, "sb");
        assert_eq!(
            sb.spec.components["api"].build_name,
            sb.spec.components["worker"].build_name
        );
    }

    #[tokio::test]
    async fn test_reuses_recent_build_before_it_is_cached() {
        let mut cluster = FakeCluster::new();
        for name in ["sb-1", "sb-2"] {
            cluster
                .service_builds
                .seed(test_service_build(name, NS, &[("api", test_build_definition("c1"))]));
        }
        cluster.sync();
        let reconciler = cluster.reconciler();

        // both reconciles run before the cache sees the new ComponentBuild
        let first = service_build(&cluster, "sb-1");
        let second = service_build(&cluster, "sb-2");
        reconciler.reconcile_service_build(&first).await.unwrap();
        reconciler.reconcile_service_build(&second).await.unwrap();

        assert_eq!(cluster.component_builds.objects().len(), 1);
        assert_eq!(
            service_build(&cluster, "sb-1").spec.components["api"].build_name,
            service_build(&cluster, "sb-2").spec.components["api"].build_name
        );
    }

    #[tokio::test]
    async fn test_reuses_cached_build_after_restart() {
        let mut cluster = FakeCluster::new();
        cluster.component_builds.seed(test_component_build("existing", NS));
        cluster
            .service_builds
            .seed(test_service_build("sb", NS, &[("api", test_build_definition("c1"))]));
        let reconciler = cluster.reconciler();
        reconcile(&mut cluster, &reconciler, "sb").await;

        assert_eq!(cluster.component_builds.objects().len(), 1);
        assert_eq!(
            service_build(&cluster, "sb").spec.components["api"].build_name.as_deref(),
            Some("existing")
        );
    }

    #[tokio::test]
    async fn test_failed_builds_are_not_reused() {
        let mut cluster = FakeCluster::new();
        cluster.component_builds.seed(test_component_build("failed", NS));
        set_child_state(&cluster, "failed", ComponentBuildState::Failed);
        cluster
            .service_builds
            .seed(test_service_build("sb", NS, &[("api", test_build_definition("c1"))]));
        let reconciler = cluster.reconciler();
        reconcile(&mut cluster, &reconciler, "sb").await;

        assert_eq!(cluster.component_builds.objects().len(), 2);
        assert_ne!(
            service_build(&cluster, "sb").spec.components["api"].build_name.as_deref(),
            Some("failed")
        );
    }

    #[tokio::test]
    async fn test_deleted_recent_build_is_replaced() {
        let mut cluster = FakeCluster::new();
        for name in ["sb-1", "sb-2"] {
            cluster
                .service_builds
                .seed(test_service_build(name, NS, &[("api", test_build_definition("c1"))]));
        }
        let reconciler = cluster.reconciler();
        reconcile(&mut cluster, &reconciler, "sb-1").await;
        let first_child = service_build(&cluster, "sb-1").spec.components["api"]
            .build_name
            .clone()
            .unwrap();
        cluster.component_builds.remove(NS, &first_child);

        reconcile(&mut cluster, &reconciler, "sb-2").await;
        let second_child = service_build(&cluster, "sb-2").spec.components["api"]
            .build_name
            .clone()
            .unwrap();
        assert_ne!(first_child, second_child);
        assert!(cluster.component_builds.object(NS, &second_child).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_reconciles_create_one_build() {
        let mut cluster = FakeCluster::new();
        for name in ["sb-1", "sb-2", "sb-3"] {
            cluster
                .service_builds
                .seed(test_service_build(name, NS, &[("api", test_build_definition("c1"))]));
        }
        cluster.sync();
        cluster.component_builds.set_yield_on_create(true);
        let reconciler = cluster.reconciler();

        let builds: Vec<ServiceBuild> = ["sb-1", "sb-2", "sb-3"]
            .iter()
            .map(|name| service_build(&cluster, name))
            .collect();
        let (a, b, c) = tokio::join!(
            reconciler.reconcile_service_build(&builds[0]),
            reconciler.reconcile_service_build(&builds[1]),
            reconciler.reconcile_service_build(&builds[2]),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(cluster.component_builds.objects().len(), 1);
        let names: BTreeSet<_> = ["sb-1", "sb-2", "sb-3"]
            .iter()
            .map(|name| service_build(&cluster, name).spec.components["api"].build_name.clone())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_succeeds_when_children_succeed() {
        let mut cluster = FakeCluster::new();
        cluster.service_builds.seed(test_service_build(
            "sb",
            NS,
            &[
                ("api", test_build_definition("c1")),
                ("worker", test_build_definition("c2")),
            ],
        ));
        let reconciler = cluster.reconciler();
        reconcile(&mut cluster, &reconciler, "sb").await;

        for child in cluster.component_builds.objects() {
            set_child_state(
                &cluster,
                child.metadata.name.as_deref().unwrap(),
                ComponentBuildState::Succeeded,
            );
        }
        reconcile(&mut cluster, &reconciler, "sb").await;

        let sb = service_build(&cluster, "sb");
        assert_eq!(sb.state(), BuildState::Succeeded);
        assert!(
            sb.spec
                .components
                .values()
                .all(|info| info.build_state == Some(ComponentBuildState::Succeeded))
        );

        // terminal: nothing more is written
        cluster.clear_writes();
        reconcile(&mut cluster, &reconciler, "sb").await;
        assert_eq!(cluster.write_count(), 0);
    }

    #[tokio::test]
    async fn test_fails_when_a_child_fails() {
        let mut cluster = FakeCluster::new();
        cluster
            .service_builds
            .seed(test_service_build("sb", NS, &[("api", test_build_definition("c1"))]));
        let reconciler = cluster.reconciler();
        reconcile(&mut cluster, &reconciler, "sb").await;

        let child = service_build(&cluster, "sb").spec.components["api"]
            .build_name
            .clone()
            .unwrap();
        cluster.component_builds.update(NS, &child, |build| {
            build.status = Some(ComponentBuildStatus {
                state: ComponentBuildState::Failed,
                last_observed_phase: None,
                failure_info: Some(ComponentBuildFailureInfo {
                    message: "exit status 2".to_string(),
                    internal: false,
                }),
            });
        });
        reconcile(&mut cluster, &reconciler, "sb").await;

        let sb = service_build(&cluster, "sb");
        let status = sb.status.unwrap();
        assert_eq!(status.state, BuildState::Failed);
        assert_eq!(
            status.message.as_deref(),
            Some("the following components failed to build: api (exit status 2)")
        );
        assert_eq!(
            sb.spec.components["api"].failure_info.as_ref().unwrap().message,
            "exit status 2"
        );
    }

    #[tokio::test]
    async fn test_steady_state_is_a_no_op() {
        let mut cluster = FakeCluster::new();
        cluster
            .service_builds
            .seed(test_service_build("sb", NS, &[("api", test_build_definition("c1"))]));
        let reconciler = cluster.reconciler();
        reconcile(&mut cluster, &reconciler, "sb").await;
        reconcile(&mut cluster, &reconciler, "sb").await;
        cluster.clear_writes();

        reconcile(&mut cluster, &reconciler, "sb").await;
        assert_eq!(cluster.write_count(), 0);
    }

    #[tokio::test]
    async fn test_component_build_events_map_to_referencing_service_builds() {
        let mut cluster = FakeCluster::new();
        let mut referencing = test_service_build("sb-1", NS, &[]);
        referencing
            .spec
            .components
            .insert("api".to_string(), info(Some("cb-1"), None));
        cluster.service_builds.seed(referencing);
        cluster.service_builds.seed(test_service_build("sb-2", NS, &[]));
        let mut elsewhere = test_service_build("sb-3", "other", &[]);
        elsewhere
            .spec
            .components
            .insert("api".to_string(), info(Some("cb-1"), None));
        cluster.service_builds.seed(elsewhere);
        cluster.sync();

        let refs = service_builds_referencing(
            &test_component_build("cb-1", NS),
            &cluster.caches.service_builds,
        );
        let names: Vec<_> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["sb-1"]);
    }
}
