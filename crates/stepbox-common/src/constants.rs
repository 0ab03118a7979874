//! System-wide constants shared by the runtime and the server.

use std::time::Duration;

/// Maximum accepted size of a `/run` request body, in bytes.
pub const MAX_BINARY_SIZE: usize = 100 << 20;

/// Ceiling for a container to emit its handshake marker after launch.
pub const START_TIMEOUT: Duration = Duration::from_secs(40);

/// Deadline for a single run, measured from container checkout.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(25);

/// Maximum bytes captured from either output stream of a container.
pub const MAX_OUTPUT_SIZE: usize = 100 << 20;

/// Memory cap handed to the isolation runtime, in bytes.
pub const MEMORY_LIMIT_BYTES: u64 = 100 << 20;

/// Literal token separating the source context from the binary on stdin.
pub const BINARY_SEPARATOR: &[u8] = b"binarySeparator";

/// First bytes written to stdout by the contained process once it is
/// ready to accept input.
pub const CONTAINED_START_MESSAGE: &[u8] = b"golang-gvisor-process-started\n";

/// Written to stderr by the contained process after it has read its
/// input and before it launches the untrusted binary.
pub const CONTAINED_STDERR_HEADER: &[u8] = b"golang-gvisor-process-got-input\n";

/// Name prefix shared by every container this service launches.
pub const CONTAINER_NAME_PREFIX: &str = "play_run_";

/// Number of random hex characters appended to [`CONTAINER_NAME_PREFIX`].
pub const CONTAINER_NAME_HEX_LEN: usize = 8;

/// Delay before a supply worker retries after a failed start.
pub const START_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Grace period between the interrupt and the kill of a container process.
pub const STOP_GRACE: Duration = Duration::from_millis(250);

/// How long a cached health result stays valid.
pub const HEALTH_CACHE_TTL: Duration = Duration::from_secs(5);

/// Deadline for a single liveness probe (checkout and close).
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval between two leak reconciliation passes.
pub const LEAK_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Deadline for one external container listing.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(1);

/// Default sandbox image hosting the contained process.
pub const DEFAULT_SANDBOX_IMAGE: &str = "ahmedakef/gotutor-sandbox-gvisor:latest";

/// Default OCI runtime passed to `docker run --runtime`.
pub const DEFAULT_OCI_RUNTIME: &str = "runsc";

/// Scratch mount inside the container where the binary is written.
pub const CONTAINED_BINARY_PATH: &str = "/tmpfs/play";

/// Step tracer launched by the contained process.
pub const DEFAULT_TRACER_PATH: &str = "/usr/local/bin/gotutor";

/// Directory, relative to the contained working directory, the tracer writes into.
pub const TRACER_OUTPUT_DIR: &str = "output";

/// File produced by the tracer inside [`TRACER_OUTPUT_DIR`].
pub const TRACER_STEPS_FILE: &str = "steps.json";

/// Interrupt-to-kill grace period granted to the tracer in contained mode.
pub const TRACER_STOP_GRACE: Duration = Duration::from_secs(3);

/// Slack kept between the contained tracer deadline and [`RUN_TIMEOUT`].
pub const TRACER_DEADLINE_SLACK: Duration = Duration::from_millis(500);

/// User-visible error for programs exceeding the run deadline.
pub const RUN_TIMEOUT_MESSAGE: &str = "timeout running program";

/// User-visible error for programs exceeding the output cap.
pub const OUTPUT_TOO_LARGE_MESSAGE: &str = "Output too large";
