//! Drives installation, verification, rotation and cleanup of the API services owned by
//! [`ClusterServiceVersion`]s

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::Secret,
        kube_aggregator::pkg::apis::apiregistration::v1::APIService,
    },
    kube::{
        self,
        api::{Api, DynamicObject, PartialObjectMeta},
        core::{error_boundary, DeserializeGuard},
        runtime::{
            controller::Action,
            events::{Recorder, Reporter},
            finalizer::{self, finalizer},
            reflector::ObjectRef,
            watcher, Controller,
        },
        Resource,
    },
    logging::controller::{report_controller_reconciled, ReconcilerError},
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{info, warn};

use crate::{
    apiservice::{
        cleanup::{self, delete_owned_api_service_resources},
        install::{self, Installer},
        verify::Verifier,
    },
    certs::{pem_sha256, should_rotate_certs, CertConfig, Clock, Issuer, SystemClock},
    cluster::{self, Cluster, KubeCluster},
    crd::{ClusterServiceVersion, CsvPhase},
    ownership::OwnerSet,
    rbac::BindingRuleChecker,
    utils::error_full_message,
};

const CONTROLLER_NAME: &str = "apiservice.stackable.tech";
const FINALIZER_NAME: &str = "apiservice.stackable.tech/cleanup";
/// Healthy descriptors are re-verified at least this often.
const RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("ClusterServiceVersion object is invalid"))]
    InvalidClusterServiceVersion {
        source: error_boundary::InvalidObject,
    },

    #[snafu(display("failed to install owned API services"))]
    Install { source: install::Error },

    #[snafu(display("failed to check owned API services"))]
    CheckAvailability { source: cluster::Error },

    #[snafu(display("failed to clean up owned API services"))]
    Cleanup { source: cleanup::Error },

    #[snafu(display("failed to update status of {csv}"))]
    UpdateStatus {
        source: cluster::Error,
        csv: ObjectRef<ClusterServiceVersion>,
    },

    #[snafu(display("failed to manage cleanup finalizer"))]
    Finalizer {
        source: Box<finalizer::Error<Error>>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Error::UpdateStatus { csv, .. } => Some(csv.clone().erase()),
            _ => None,
        }
    }
}

pub struct Ctx<C> {
    cluster: C,
    clock: Arc<dyn Clock>,
    installer: Installer<C>,
    verifier: Verifier<C>,
}

impl<C: Cluster> Ctx<C> {
    pub fn new(cluster: C, clock: Arc<dyn Clock>, cert_config: CertConfig) -> Self {
        Self {
            installer: Installer::new(
                cluster.clone(),
                Issuer::new(clock.clone(), cert_config),
            ),
            verifier: Verifier::new(
                cluster.clone(),
                clock.clone(),
                Arc::new(BindingRuleChecker::new(cluster.clone())),
            ),
            cluster,
            clock,
        }
    }
}

/// Maps an object carrying ownership labels to the descriptors that own it.
fn owners_of<K: Resource>(obj: K) -> Vec<ObjectRef<DeserializeGuard<ClusterServiceVersion>>> {
    OwnerSet::from_meta(obj.meta())
        .iter()
        .filter(|owner| owner.kind == ClusterServiceVersion::kind(&()))
        .map(|owner| ObjectRef::new(&owner.name).within(&owner.namespace))
        .collect()
}

pub async fn start(client: kube::Client, cert_config: CertConfig) {
    let ctx = Arc::new(Ctx::new(
        KubeCluster::new(client.clone()),
        Arc::new(SystemClock),
        cert_config,
    ));
    let event_recorder = Arc::new(Recorder::new(
        client.clone(),
        Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: None,
        },
    ));
    Controller::new(
        Api::<DeserializeGuard<ClusterServiceVersion>>::all(client.clone()),
        watcher::Config::default(),
    )
    .watches(
        Api::<PartialObjectMeta<APIService>>::all(client.clone()),
        watcher::Config::default().labels(crate::ownership::OWNER_KEY),
        owners_of,
    )
    .watches(
        Api::<PartialObjectMeta<Secret>>::all(client.clone()),
        watcher::Config::default().labels(crate::ownership::OWNER_KEY),
        owners_of,
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each_concurrent(16, move |res| {
        let event_recorder = event_recorder.clone();
        async move { report_controller_reconciled(&event_recorder, CONTROLLER_NAME, &res).await }
    })
    .await;
}

async fn reconcile(
    csv: Arc<DeserializeGuard<ClusterServiceVersion>>,
    ctx: Arc<Ctx<KubeCluster>>,
) -> Result<Action> {
    let csv = csv
        .0
        .as_ref()
        .map_err(error_boundary::InvalidObject::clone)
        .context(InvalidClusterServiceVersionSnafu)?;
    let csv = Arc::new(csv.clone());
    let api = Api::<ClusterServiceVersion>::namespaced(
        ctx.cluster.client().clone(),
        &csv.namespace_or_default(),
    );
    finalizer(&api, FINALIZER_NAME, csv, |event| async move {
        match event {
            finalizer::Event::Apply(csv) => apply(&csv, &ctx).await,
            finalizer::Event::Cleanup(csv) => cleanup(&csv, &ctx).await,
        }
    })
    .await
    .map_err(Box::new)
    .context(FinalizerSnafu)
}

fn error_policy(
    _csv: Arc<DeserializeGuard<ClusterServiceVersion>>,
    _error: &Error,
    _ctx: Arc<Ctx<KubeCluster>>,
) -> Action {
    Action::requeue(Duration::from_secs(5))
}

/// Records the outcome of a pass on `csv`, unless it is being replaced or deleted (which is decided
/// elsewhere).
fn set_phase(csv: &mut ClusterServiceVersion, phase: CsvPhase, reason: &str, message: String) {
    if csv.is_being_replaced() {
        return;
    }
    let status = csv.status.get_or_insert_with(Default::default);
    status.phase = Some(phase);
    status.reason = Some(reason.to_string());
    status.message = Some(message);
}

pub(crate) async fn apply<C: Cluster>(csv: &ClusterServiceVersion, ctx: &Ctx<C>) -> Result<Action> {
    let mut updated = csv.clone();
    let csv_ref = ObjectRef::from_obj(csv);
    if csv.owned_api_services().is_empty() {
        return Ok(Action::await_change());
    }

    let checked = ctx
        .verifier
        .check_api_service_resources(csv, pem_sha256)
        .await;
    let rotate = should_rotate_certs(csv, ctx.clock.now());
    match checked {
        Ok(()) if !rotate => {
            let available = ctx
                .verifier
                .are_api_services_available(csv)
                .await
                .context(CheckAvailabilitySnafu)?;
            if available {
                set_phase(
                    &mut updated,
                    CsvPhase::Succeeded,
                    "InstallSucceeded",
                    "all owned API services are available".to_string(),
                );
            } else {
                set_phase(
                    &mut updated,
                    CsvPhase::Installing,
                    "APIServiceNotAvailable",
                    "waiting for owned API services to become available".to_string(),
                );
            }
        }
        Err(err) if !err.is_actionable() => {
            warn!(csv = %csv_ref, error = error_full_message(&err), "API service ownership conflict");
            set_phase(
                &mut updated,
                CsvPhase::Failed,
                "OwnerConflict",
                error_full_message(&err),
            );
        }
        checked => {
            match &checked {
                Err(err) => info!(csv = %csv_ref, error = %err, "repairing owned API services"),
                Ok(()) => info!(csv = %csv_ref, "rotating certificates of owned API services"),
            }
            let strategy = updated.spec.install.strategy_spec.clone();
            match ctx
                .installer
                .install_owned_api_service_requirements(&mut updated, &strategy)
                .await
            {
                Ok(strategy) => {
                    ctx.installer
                        .apply_deployments(&updated, &strategy)
                        .await
                        .context(InstallSnafu)?;
                    set_phase(
                        &mut updated,
                        CsvPhase::Installing,
                        "InstallingAPIServices",
                        "installed owned API services".to_string(),
                    );
                }
                Err(err) if err.is_adoption_failure() => {
                    warn!(csv = %csv_ref, error = error_full_message(&err), "API service ownership conflict");
                    set_phase(
                        &mut updated,
                        CsvPhase::Failed,
                        "OwnerConflict",
                        error_full_message(&err),
                    );
                }
                Err(err) => return Err(err).context(InstallSnafu),
            }
        }
    }

    if updated.status != csv.status {
        ctx.cluster
            .update_status(&updated)
            .await
            .context(UpdateStatusSnafu { csv: csv_ref })?;
    }
    Ok(Action::requeue(requeue_after(&updated, ctx.clock.as_ref())))
}

/// Waits until the next resync, or until the certificates are due for rotation if that comes first.
fn requeue_after(csv: &ClusterServiceVersion, clock: &dyn Clock) -> Duration {
    csv.certs_rotate_at()
        .and_then(|rotate_at| Duration::try_from(rotate_at - clock.now()).ok())
        .map_or(RESYNC_INTERVAL, |until_rotation| {
            until_rotation.min(RESYNC_INTERVAL)
        })
}

async fn cleanup<C: Cluster>(csv: &ClusterServiceVersion, ctx: &Ctx<C>) -> Result<Action> {
    delete_owned_api_service_resources(&ctx.cluster, csv)
        .await
        .context(CleanupSnafu)?;
    Ok(Action::await_change())
}
