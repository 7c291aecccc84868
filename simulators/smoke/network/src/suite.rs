use hivesim::{dyn_async, Client, ClientOptions, ClientTestSpec, FileSource, Suite, Test, RPC_PORT};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Container id the host resolves to the simulator itself.
const SIMULATION: &str = "simulation";
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

const PROBE_FILE: &str = "/hive-smoke/probe.txt";
const PROBE_CONTENT: &str = "hive smoke probe\n";

/// Where the simulator expects the client to accept connections.
#[derive(Clone, Copy, Debug)]
pub struct Probe {
    pub rpc_port: u16,
    pub dial_timeout: Duration,
}

impl Default for Probe {
    fn default() -> Self {
        Self {
            rpc_port: RPC_PORT,
            dial_timeout: DIAL_TIMEOUT,
        }
    }
}

/// Clients of different types run side by side, each on its own network.
fn network_name(client_type: &str) -> String {
    format!("iptest-{client_type}")
}

pub fn network_suite(probe: Probe) -> Suite {
    let mut suite = Suite::new(
        "network",
        "Checks the host's container networking and exec support against every client. \
        Each client joins a fresh network together with the simulator, must be reachable \
        on its RPC port through that network, and leaves it again. A second test runs \
        commands inside the container.",
    );
    suite.add(ClientTestSpec {
        name: "iptest".to_string(),
        description: "Connects the client and the simulator to a network and dials the client."
            .to_string(),
        always_run: false,
        role: None,
        options: ClientOptions::new(),
        run: ip_test,
        data: probe,
        client: None,
    });
    suite.add(ClientTestSpec {
        name: "exec".to_string(),
        description: "Reads back a file uploaded at client start and runs a command in the \
            container."
            .to_string(),
        always_run: false,
        role: None,
        options: ClientOptions::new().file(PROBE_FILE, FileSource::bytes(PROBE_CONTENT)),
        run: exec_test,
        data: (),
        client: None,
    });
    suite
}

dyn_async! {
    async fn ip_test<'a>(test: &'a mut Test, client: Client, probe: Probe) {
        let network = network_name(&client.kind);
        if let Err(err) = test.create_network(&network).await {
            test.fatal(format!("could not create network: {err}"));
        }
        for container in [client.container.as_str(), SIMULATION] {
            if let Err(err) = test.connect_container(&network, container).await {
                test.fatal(format!("could not connect {container} to network: {err}"));
            }
        }

        let client_ip = match test.container_network_ip(&network, &client.container).await {
            Ok(ip) => ip,
            Err(err) => test.fatal(format!("could not get client network ip address: {err}")),
        };
        match test.container_network_ip(&network, SIMULATION).await {
            Ok(ip) => test.log(format!("simulation is {ip} on {network}")),
            Err(err) => test.fatal(format!(
                "could not get network ip address for simulation container: {err}"
            )),
        }

        let addr = SocketAddr::new(client_ip, probe.rpc_port);
        match timeout(probe.dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => test.log(format!("dialed client at {addr}")),
            Ok(Err(err)) => test.fatal(format!("failed to dial client at {addr}: {err}")),
            Err(_) => test.fatal(format!("failed to dial client at {addr}: timed out")),
        }

        for container in [client.container.as_str(), SIMULATION] {
            if let Err(err) = test.disconnect_container(&network, container).await {
                test.fatal(format!("could not disconnect {container} from network: {err}"));
            }
        }
        if let Err(err) = test.container_network_ip(&network, &client.container).await {
            test.log(format!("client left {network}: {err}"));
        } else {
            test.error("client still has an address after disconnecting");
        }
        if let Err(err) = test.remove_network(&network).await {
            test.fatal(format!("could not remove network: {err}"));
        }
    }
}

dyn_async! {
    async fn exec_test<'a>(test: &'a mut Test, client: Client, _data: ()) {
        let out = match client.exec(&["cat", PROBE_FILE]).await {
            Ok(out) => out,
            Err(err) => test.fatal(format!("exec failed: {err}")),
        };
        if out.exit_code != 0 {
            test.fatal(format!("cat {PROBE_FILE} exited with {}: {}", out.exit_code, out.stderr));
        }
        if out.stdout != PROBE_CONTENT {
            test.error(format!("wrong content in {PROBE_FILE}: {:?}", out.stdout));
        }

        match client.exec(&["echo", "hello", "hive"]).await {
            Ok(out) if out.exit_code == 0 && out.stdout.trim_end() == "hello hive" => {}
            Ok(out) => test.error(format!(
                "echo exited with {}, stdout {:?}",
                out.exit_code, out.stdout
            )),
            Err(err) => test.error(format!("exec failed: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hivesim::fakes::FakeHost;
    use hivesim::types::{ClientDefinition, ClientMetadata};
    use hivesim::{run_suite, Simulation};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    fn client(name: &str) -> ClientDefinition {
        ClientDefinition {
            name: name.to_string(),
            version: String::new(),
            meta: ClientMetadata {
                roles: vec!["eth1".to_string()],
            },
        }
    }

    async fn host() -> FakeHost {
        let host = FakeHost::start(vec![client("geth"), client("reth")])
            .await
            .unwrap();
        host.set_client_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        host
    }

    fn probe(rpc_port: u16) -> Probe {
        Probe {
            rpc_port,
            dial_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn every_client_passes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((_conn, _)) = listener.accept().await {}
        });
        let host = host().await;

        let suite = network_suite(probe(port));
        let summary = run_suite(Simulation::new_at(&host.url), vec![suite]).await;

        assert_eq!(summary.passed, 4, "{:?}", host.results());
        assert_eq!(summary.exit_code(), 0);
        let state = host.snapshot();
        assert!(state.networks.is_empty());
        let mut removed = state.removed_networks.clone();
        removed.sort();
        assert_eq!(removed, vec!["iptest-geth", "iptest-reth"]);
        assert!(state.containers.values().all(|c| c.stopped));
    }

    #[tokio::test]
    async fn unreachable_client_fails() {
        // nothing listens on a port once its listener is gone
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let host = host().await;

        let suite = network_suite(probe(port));
        let summary = run_suite(Simulation::new_at(&host.url), vec![suite]).await;

        let result = host.result_of("iptest (geth)").unwrap();
        assert!(!result.pass);
        assert!(result.details.contains("failed to dial client"), "{}", result.details);
        assert!(host.result_of("exec (geth)").unwrap().pass);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.exit_code(), 1);
        // the runner removes what the failed tests left behind
        assert!(host.snapshot().networks.is_empty());
    }
}
