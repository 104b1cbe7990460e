//! An interactive REPL against a locally started kernel, driven straight
//! through the request correlator (no CRDT document involved).

use std::io::Write;
use std::time::Duration;

use kernel_protocol::correlator::RequestCorrelator;
use kernel_protocol::environment;
use kernel_protocol::handshake;
use kernel_protocol::supervisor::{KernelSupervisor, TokioProcessLauncher};
use kernel_protocol::transport::ZmqChannelTransport;
use kernel_protocol::wire::{
    ErrorReply, ExecuteRequest, ExecuteResult, KernelMessage, KernelMessageType, KernelStatus,
    Status, Stream,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    println!("Available kernels:");
    let kernels = environment::list_kernels(None).await;
    for (path, kernel_spec) in &kernels {
        println!("  {:20} {}", kernel_spec.display_name, path.display());
    }

    let mut kernel_spec = loop {
        print!("\nPick a kernel: ");
        std::io::stdout().flush().unwrap();

        let mut input = String::new();
        std::io::stdin().read_line(&mut input).unwrap();
        let input = input.trim();
        match kernels.iter().find(|(_, spec)| spec.display_name == input) {
            Some((_, kernel_spec)) => break kernel_spec.clone(),
            None => println!("Invalid kernel name, try again"),
        }
    };

    if kernel_spec.argv[0] == "python" {
        // Temporary hack
        kernel_spec.argv[0] = "python3.11".into();
    }

    let connection_file = std::env::temp_dir().join(format!("kernel-protocol-{}.json", uuid::Uuid::new_v4()));
    let mut supervisor = KernelSupervisor::new(
        kernel_spec,
        None,
        connection_file,
        Box::new(TokioProcessLauncher),
        Box::new(ZmqChannelTransport),
    );
    supervisor.start().await.unwrap();

    println!("\nStarted kernel.");
    let correlator = supervisor.correlator().unwrap();
    handshake::wait_until_ready(correlator, "run-kernel-demo", Duration::from_secs(30))
        .await
        .unwrap();

    while supervisor.is_alive() {
        print!("> ");
        std::io::stdout().flush().unwrap();

        let mut input = String::new();
        std::io::stdin().read_line(&mut input).unwrap();

        run_cell(supervisor.correlator().unwrap(), &input).await;
    }

    supervisor.stop().await.unwrap();
}

async fn run_cell(correlator: &RequestCorrelator, code: &str) {
    let request = KernelMessage::new(
        KernelMessageType::ExecuteRequest,
        "run-kernel-demo",
        ExecuteRequest {
            code: code.to_string(),
            silent: false,
            store_history: true,
            user_expressions: Default::default(),
            allow_stdin: false,
            stop_on_error: true,
        },
    );
    let pending = correlator.install(request.header.msg_id.clone());
    correlator.send_shell(&request).await.unwrap();

    let mut status = KernelStatus::Busy;
    while status != KernelStatus::Idle {
        let msg = pending.recv_iopub().await.unwrap();
        match msg.header.msg_type {
            KernelMessageType::Status => {
                let msg: KernelMessage<Status> = msg.into_typed().unwrap();
                status = msg.content.execution_state;
            }
            KernelMessageType::Stream => {
                let msg: KernelMessage<Stream> = msg.into_typed().unwrap();
                if msg.content.name == "stdout" {
                    print!("{}", msg.content.text);
                } else {
                    eprint!("{}", msg.content.text);
                }
            }
            KernelMessageType::ExecuteResult => {
                let msg: KernelMessage<ExecuteResult> = msg.into_typed().unwrap();
                println!("-> {}", msg.content.data["text/plain"].as_str().unwrap());
            }
            KernelMessageType::Error => {
                let msg: KernelMessage<ErrorReply> = msg.into_typed().unwrap();
                for line in &msg.content.traceback {
                    println!("{line}");
                }
            }
            _ => (),
        }
    }
}
