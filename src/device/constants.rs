use uuid::Uuid;

/**
 * Advertised name prefix of Valve Index (V2) lighthouses.
 */
pub const V2_NAME_PREFIX: &str = "LHB-";

/**
 * Advertised name prefix of HTC Vive (V1) lighthouses.
 */
pub const V1_NAME_PREFIX: &str = "HTC BS";

/**
 * The BLE service carrying the V2 power, channel and identify characteristics.
 */
pub const V2_PWR_SERVICE: Uuid = Uuid::from_u128(0x00001523_1212_efde_1523_785feabcd124);
pub const V2_PWR_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00001525_1212_efde_1523_785feabcd124);
pub const V2_CHANNEL_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00001524_1212_efde_1523_785feabcd124);
pub const V2_IDENTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00008421_1212_efde_1523_785feabcd124);

pub const V2_PWR_ON: u8 = 0x01;
pub const V2_PWR_STANDBY: u8 = 0x02;
pub const V2_PWR_SLEEP: u8 = 0x00;
pub const V2_IDENTIFY: u8 = 0x00;

/**
 * Codes read back from the V2 power characteristic.
 * Codes between sleep and on (starting up, booting) are transitional.
 */
pub const V2_STATE_SLEEP: u8 = 0x00;
pub const V2_STATE_STARTING_UP: u8 = 0x01;
pub const V2_STATE_STANDBY: u8 = 0x02;
pub const V2_STATE_BOOTING: u8 = 0x08;
pub const V2_STATE_BOOTING_ALT: u8 = 0x09;
pub const V2_STATE_ON: u8 = 0x0B;

/**
 * The BLE service of V1 lighthouses. The V1 protocol is community documented and has
 * not been verified against every firmware revision.
 */
pub const V1_PWR_SERVICE: Uuid = Uuid::from_u128(0x0000cb00_0000_1000_8000_00805f9b34fb);
pub const V1_PWR_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000cb01_0000_1000_8000_00805f9b34fb);

/**
 * Length of a V1 power command, the pair id is stored little endian at offset 4.
 */
pub const V1_COMMAND_LEN: usize = 20;
pub const V1_COMMAND_ON: [u8; 4] = [0x12, 0x00, 0x00, 0x00];
pub const V1_COMMAND_SLEEP: [u8; 4] = [0x12, 0x02, 0x00, 0x01];

/**
 * Standard "Device Information" characteristics.
 */
pub const FIRMWARE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb);
pub const MODEL_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
pub const HARDWARE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00002a27_0000_1000_8000_00805f9b34fb);
pub const MANUFACTURER_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);

/**
 * How long (milliseconds) a single connect attempt may take.
 */
pub const CONNECTION_TIMEOUT: u64 = 10_000;

/**
 * How long (milliseconds) a command may wait for its response.
 */
pub const COMMAND_TIMEOUT: u64 = 5_000;

/**
 * How many connect attempts a dispatch makes before giving up.
 */
pub const RETRY_COUNT: u32 = 3;

/**
 * Delay (milliseconds) before the second connect attempt, doubled for each later one.
 */
pub const BACKOFF_BASE: u64 = 500;

/**
 * How long (milliseconds) an unused connection is kept open. Shorter than the power
 * state interval so the link is free between polls.
 */
pub const IDLE_DISCONNECT: u64 = 2_000;

/**
 * How many connect attempts may run on the adapter at once.
 */
pub const MAX_CONCURRENT_CONNECTS: usize = 1;

/**
 * How often (milliseconds) the power state of every lighthouse is polled.
 */
pub const POWER_STATE_INTERVAL: u64 = 5_000;

/**
 * How often (milliseconds) the static device information is re-read.
 */
pub const INFO_INTERVAL: u64 = 30 * 60 * 1000;

/**
 * Consecutive failed refreshes after which a lighthouse is reported unavailable.
 */
pub const UNAVAILABLE_THRESHOLD: u32 = 3;

/**
 * Wait (milliseconds) before polling a lighthouse again after its first failed poll.
 * Doubles with every further failure.
 */
pub const FAILURE_COOLDOWN: u64 = 5_000;

/**
 * Upper bound (milliseconds) of the failure cooldown.
 */
pub const EXTENDED_COOLDOWN: u64 = 30_000;

/**
 * Consecutive failed polls after which the extended cooldown is always used.
 */
pub const EXTENDED_COOLDOWN_AFTER: u32 = 5;

/**
 * How often (milliseconds) the discovery scan is restarted.
 */
pub const SCAN_INTERVAL: u64 = 60_000;
