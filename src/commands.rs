pub mod registers {
    use crate::catalog::{self, Entry};
    use crate::output;
    use crate::registers::{FieldType, RegisterGroup, RegisterKey};

    /// Search and output the registers known to the bridge.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only list registers whose address, name or parameter contains this text.
        filter: Option<String>,
        #[clap(flatten)]
        catalog: catalog::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the register map")]
        Catalog(#[source] catalog::Error),
        #[error("could not output the registers")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema<'a> {
        pub register: RegisterKey,
        pub name: &'a str,
        pub param: Option<&'a str>,
        pub group: Option<RegisterGroup>,
        #[serde(rename = "type")]
        pub field_type: Option<FieldType>,
        pub length: u16,
        pub scale: u16,
        pub unit: &'a str,
        pub writable: bool,
    }

    impl<'a> From<&'a Entry> for RegisterSchema<'a> {
        fn from(entry: &'a Entry) -> Self {
            let descriptor = &entry.descriptor;
            RegisterSchema {
                register: entry.key,
                name: &descriptor.name,
                param: descriptor.param.as_deref(),
                group: descriptor.group,
                field_type: descriptor.field_type,
                length: descriptor.length,
                scale: descriptor.scale,
                unit: &descriptor.unit,
                writable: descriptor.writable,
            }
        }
    }

    impl RegisterSchema<'_> {
        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            self.register.to_string().contains(&pattern)
                || self.name.to_lowercase().contains(&pattern)
                || self.param.is_some_and(|p| p.to_lowercase().contains(&pattern))
        }

        fn table_row(&self) -> Vec<String> {
            let or_dash = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
            vec![
                self.register.to_string(),
                self.name.to_string(),
                or_dash(self.param.map(str::to_string)),
                or_dash(self.group.map(|g| g.to_string())),
                or_dash(self.field_type.map(|t| t.to_string())),
                self.length.to_string(),
                self.scale.to_string(),
                self.unit.to_string(),
                if self.writable { "rw" } else { "r" }.to_string(),
            ]
        }
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let catalog = args.catalog.load().await.map_err(Error::Catalog)?;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec![
                "Register", "Name", "Parameter", "Group", "Type", "Length", "Scale", "Unit", "Mode",
            ])
            .map_err(Error::Output)?;
        for entry in catalog.entries() {
            let register = RegisterSchema::from(entry);
            if let Some(pattern) = &args.filter {
                if !register.is_match(pattern) {
                    continue;
                }
            }
            output
                .result(|| register.table_row(), || &register)
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::catalog::Catalog;

        #[test]
        fn filters() {
            let catalog = Catalog::builtin();
            let matches = |pattern: &str| {
                catalog
                    .entries()
                    .iter()
                    .map(RegisterSchema::from)
                    .filter(|r| r.is_match(pattern))
                    .map(|r| r.register.to_string())
                    .collect::<Vec<_>>()
            };
            assert_eq!(matches("11000"), ["11000"]);
            assert!(matches("GRID_POWER").contains(&"11000".to_string()));
            assert!(matches("autarky").contains(&"autarky-day".to_string()));
        }

        #[test]
        fn rows() {
            let catalog = Catalog::builtin();
            let entry = catalog.by_param("grid_power").expect("grid_power");
            let row = RegisterSchema::from(entry).table_row();
            assert_eq!(row[..5], ["11000", "Grid power", "grid_power", "now-base", "I32"]);
            assert_eq!(row[8], "r");
        }
    }
}

pub mod read {
    use crate::catalog;
    use crate::connection::{self, FieldBus as _, ModbusClient};
    use crate::output;
    use crate::registers::{RegisterGroup, Value};
    use crate::scheduler::{self, GroupReader};
    use std::sync::Arc;

    /// Read register groups once and output their values.
    #[derive(clap::Parser)]
    pub struct Args {
        /// The register groups to read.
        #[arg(required = true, value_enum)]
        groups: Vec<RegisterGroup>,
        /// Number of decimals in floating point values.
        #[arg(long, default_value = "3")]
        float_precision: usize,
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        catalog: catalog::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the register map")]
        Catalog(#[source] catalog::Error),
        #[error("could not output the values")]
        Output(#[source] output::Error),
        #[error("reading from the inverter failed")]
        Read(#[source] scheduler::Error),
    }

    #[derive(serde::Serialize)]
    struct Record<'a> {
        group: RegisterGroup,
        param: &'a str,
        name: &'a str,
        value: &'a Value,
        unit: &'a str,
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let catalog = Arc::new(args.catalog.load().await.map_err(Error::Catalog)?);
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec!["Group", "Parameter", "Name", "Value", "Unit"])
            .map_err(Error::Output)?;
        let mut client = ModbusClient::new(args.connection);
        let mut reader = GroupReader::new(catalog);
        let mut result = Ok(());
        for group in args.groups {
            let values = match reader.read(&mut client, group).await {
                Ok(values) => values,
                Err(e) => {
                    result = Err(Error::Read(e));
                    break;
                }
            };
            for value in &values {
                output
                    .result(
                        || {
                            vec![
                                group.to_string(),
                                value.param.clone(),
                                value.name.clone(),
                                value.value.to_payload(args.float_precision),
                                value.unit.clone(),
                            ]
                        },
                        || Record {
                            group,
                            param: &value.param,
                            name: &value.name,
                            value: &value.value,
                            unit: &value.unit,
                        },
                    )
                    .map_err(Error::Output)?;
            }
        }
        client.disconnect().await;
        result?;
        output.commit().map_err(Error::Output)
    }
}

pub mod run {
    use crate::catalog;
    use crate::connection::{self, ModbusClient};
    use crate::discovery;
    use crate::mqtt::{self, MqttClient};
    use crate::scheduler::{self, Poller};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::{info, warn};

    /// Poll the inverter and publish its values over MQTT until interrupted.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        mqtt: mqtt::Args,
        #[clap(flatten)]
        scheduler: scheduler::Args,
        #[clap(flatten)]
        discovery: discovery::Args,
        #[clap(flatten)]
        catalog: catalog::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the register map")]
        Catalog(#[source] catalog::Error),
    }

    /// Resolves on Ctrl+C, or SIGTERM on Unix.
    async fn shutdown_signal() {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(terminate) => Some(terminate),
                Err(e) => {
                    warn!(message = "cannot listen for SIGTERM", err = %e);
                    None
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = async {
                    match &mut terminate {
                        Some(terminate) => { terminate.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(message = "cannot listen for Ctrl+C", err = %e);
                std::future::pending::<()>().await
            }
        }
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let catalog = Arc::new(args.catalog.load().await.map_err(Error::Catalog)?);
        let cancel = CancellationToken::new();
        let signal = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                shutdown_signal().await;
                info!(message = "shutdown requested");
                cancel.cancel();
            }
        });
        let (client, eventloop) = MqttClient::new(&args.mqtt);
        let (inbound, messages) = mpsc::unbounded_channel();
        let driver = tokio::spawn(mqtt::drive(eventloop, client.clone(), inbound));
        let poller = Poller::new(
            args.scheduler,
            &args.mqtt,
            args.discovery,
            catalog,
            ModbusClient::new(args.connection),
            client,
            messages,
        );
        poller.run(cancel).await;
        signal.abort();
        match tokio::time::timeout(Duration::from_secs(5), driver).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(message = "the MQTT event loop failed", err = %e),
            Err(_) => warn!(message = "the MQTT event loop did not finish in time"),
        }
        Ok(())
    }
}
