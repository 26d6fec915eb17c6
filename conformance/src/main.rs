mod harness;

use harness::{ConformanceOptions, run_battery};
use pocket_sync::server::LocalServer;
use pocket_sync::transport::TcpDialer;

fn usage() -> ! {
    eprintln!("usage: conformance <host:port> [--auth TOKEN]");
    eprintln!("       conformance --local [--auth TOKEN]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    let mut addr: Option<String> = None;
    let mut auth: Option<String> = None;
    let mut local = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--local" => local = true,
            "--auth" => match args.next() {
                Some(token) => auth = Some(token),
                None => usage(),
            },
            _ if arg.starts_with('-') => usage(),
            _ if addr.is_none() => addr = Some(arg),
            _ => usage(),
        }
    }

    // Keep the in-process server alive for the whole run.
    let local_server;
    let target = if local {
        local_server = match &auth {
            Some(token) => LocalServer::with_auth(token.clone()),
            None => LocalServer::new(),
        };
        match local_server.listen("127.0.0.1:0").await {
            Ok(bound) => bound.to_string(),
            Err(error) => {
                eprintln!("failed to start local server: {error}");
                std::process::exit(1);
            }
        }
    } else {
        match addr {
            Some(addr) => addr,
            None => usage(),
        }
    };

    let dialer = match TcpDialer::new(&format!("tcp://{target}")) {
        Ok(dialer) => dialer,
        Err(error) => {
            eprintln!("bad address {target:?}: {error}");
            std::process::exit(2);
        }
    };

    let options = ConformanceOptions {
        expect_auth: auth.is_some(),
        auth_token: auth,
    };

    println!("running conformance battery against {target}");
    let report = run_battery(&dialer, &options).await;
    print!("{}", report.render());
    std::process::exit(if report.compliant() { 0 } else { 1 });
}
