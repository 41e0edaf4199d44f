use clap::{crate_description, crate_version, Parser};
use stackable_apiservice_operator::{
    certs::{CertConfig, DEFAULT_ORGANIZATION},
    controller,
    crd::ClusterServiceVersion,
    OPERATOR_NAME,
};
use stackable_operator::{kube::CustomResourceExt, logging::TracingTarget, time::Duration};

pub const APP_NAME: &str = "apiservice";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: stackable_operator::cli::Command<ApiServiceOperatorRun>,
}

#[derive(clap::Parser)]
struct ApiServiceOperatorRun {
    /// Lifetime of the issued CA and serving certificates
    #[arg(long, env, default_value = "730d")]
    cert_validity: Duration,
    /// Certificates are reissued once less than this is left of their lifetime
    #[arg(long, env, default_value = "1d")]
    cert_min_fresh: Duration,
    /// Organization recorded in the subject of issued certificates
    #[arg(long, env, default_value = DEFAULT_ORGANIZATION)]
    cert_organization: String,
    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        stackable_operator::cli::Command::Crd => {
            print!("{}", serde_yaml::to_string(&ClusterServiceVersion::crd())?);
        }
        stackable_operator::cli::Command::Run(ApiServiceOperatorRun {
            cert_validity,
            cert_min_fresh,
            cert_organization,
            tracing_target,
        }) => {
            stackable_operator::logging::initialize_logging(
                "APISERVICE_OPERATOR_LOG",
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET.unwrap_or("unknown target"),
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            anyhow::ensure!(
                cert_min_fresh < cert_validity,
                "--cert-min-fresh must be shorter than --cert-validity"
            );
            let client =
                stackable_operator::client::create_client(Some(OPERATOR_NAME.to_string())).await?;
            controller::start(
                client.as_kube_client(),
                CertConfig {
                    validity: cert_validity,
                    min_fresh: cert_min_fresh,
                    organization: cert_organization,
                },
            )
            .await;
        }
    }
    Ok(())
}
