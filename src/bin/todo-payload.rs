use std::process::ExitCode;

use grader::payload::{PayloadEnv, PayloadError, run_payload, todo_app};

fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("warn"));
    let env = PayloadEnv::from_env();

    match run_payload(&env, todo_app::grade) {
        Ok(()) => ExitCode::SUCCESS,
        Err(PayloadError::Write(e)) => {
            log::error!(
                "Failed to write the result file {}: {e}",
                env.result_path.display()
            );
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
