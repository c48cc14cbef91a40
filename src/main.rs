#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::CustomResourceExt;

use kiln::{auth, controller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    #[derive(Clone, Parser)]
    #[clap(version)]
    struct Args {
        /// The tracing filter used for logs
        #[clap(long, env = "KILN_LOG", default_value = "kiln=info,warn")]
        log_level: kubert::LogFilter,

        /// The logging format
        #[clap(long, default_value = "plain")]
        log_format: kubert::LogFormat,

        #[clap(flatten)]
        client: kubert::ClientArgs,

        #[clap(flatten)]
        admin: kubert::AdminArgs,

        #[command(subcommand)]
        command: Option<Commands>,
    }

    #[derive(Clone, Subcommand)]
    enum Commands {
        /// Generates k8s manifests
        Manifests,
    }

    let Args {
        log_level,
        log_format,
        client,
        admin,
        command,
    } = Args::parse();

    match &command {
        Some(Commands::Manifests) => {
            println!(
                "{}",
                serde_yaml::to_string(&kiln::resources::ImageBuild::crd()).unwrap(),
            );
        }
        None => {
            let rt = kubert::Runtime::builder()
                .with_log(log_level, log_format)
                .with_admin(admin)
                .with_client(client)
                .build()
                .await?;

            // Cloud providers register before the first reconciliation; the
            // registry is shared read-only with every worker after this.
            let http = reqwest::Client::new();
            let challenger = Arc::new(auth::HttpLoginChallenger::new(http.clone()));
            let providers = Arc::new(auth::load_cloud_providers(http, challenger).await?);

            let controller = controller::run(rt.client(), providers);

            // Both runtimes implements graceful shutdown, so poll until both are done
            tokio::join!(controller, rt.run()).1?;
        }
    }

    Ok(())
}
