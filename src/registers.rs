/// The expansion hardware a register belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Board {
    Io,
    Rtd,
    ControlLogic,
}

impl Board {
    pub const fn layout(self) -> Layout {
        match self {
            Board::Io => Layout { start: 11000, slot_stride: 100, slots: 4 },
            Board::Rtd => Layout { start: 11000, slot_stride: 1000, slots: 4 },
            // Control logic registers are absolute.
            Board::ControlLogic => Layout { start: 0, slot_stride: 0, slots: 1 },
        }
    }
}

impl std::fmt::Display for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Board::Io => "I/O board",
            Board::Rtd => "RTD board",
            Board::ControlLogic => "control logic",
        })
    }
}

impl serde::Serialize for Board {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.into())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub start: u16,
    pub slot_stride: u16,
    pub slots: u16,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct Mode(u8);

impl serde::Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0 & Self::R.0 == 0 { "-" } else { "R" })?;
        f.write_str(if self.0 & Self::W.0 == 0 { "-" } else { "W" })?;
        Ok(())
    }
}

impl Mode {
    pub const R: Self = Self(1 << 0);
    pub const W: Self = Self(1 << 1);
    pub const RW: Self = Self(Self::R.0 | Self::W.0);
    const R_: Self = Self::R;
    const _W: Self = Self::W;

    pub const fn readable(self) -> bool {
        self.0 & Self::R.0 != 0
    }

    pub const fn writable(self) -> bool {
        self.0 & Self::W.0 != 0
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("slot {slot} is out of range for the {board} (valid slots are 0..{slots})")]
    SlotOutOfRange { board: Board, slot: u16, slots: u16 },
    #[error("channel {channel} is out of range for `{function}` (valid channels are 0..{channels})")]
    ChannelOutOfRange { function: Function, channel: u16, channels: u16 },
    #[error("pressure sensor ids start at 1")]
    SensorIdZero,
    #[error("computed register address {0} does not fit into 16 bits")]
    AddressOverflow(u32),
}

/// Compute the register address of `base` on the given slot and channel of `board`.
///
/// `address = start + slot * slot_stride + base + channel * channel_stride`
pub fn resolve(
    board: Board,
    base: u16,
    slot: u16,
    channel: u16,
    channel_stride: u16,
) -> Result<u16, Error> {
    let layout = board.layout();
    if slot >= layout.slots {
        return Err(Error::SlotOutOfRange { board, slot, slots: layout.slots });
    }
    let address = u32::from(layout.start)
        + u32::from(slot) * u32::from(layout.slot_stride)
        + u32::from(base)
        + u32::from(channel) * u32::from(channel_stride);
    u16::try_from(address).map_err(|_| Error::AddressOverflow(address))
}

macro_rules! for_each_function {
    ($m:ident) => {
        $m! {
            DigitalOutput:             Io, 1, width = 1, channels = 8, RW, "Digital output state";
            DigitalInput:              Io, 9, width = 1, channels = 8, R_, "Digital input state";
            AnalogMode:                Io, 17, width = 1, channels = 4, RW, "Analog port mode (channel 0..3 = port A..D)";
            AoVoltage:                 Io, 37, width = 2, channels = 4, RW, "Analog output voltage";
            AoCurrent:                 Io, 45, width = 2, channels = 4, RW, "Analog output current";
            AiVoltage:                 Io, 53, width = 2, channels = 4, R_, "Analog input voltage";
            AiCurrent:                 Io, 61, width = 2, channels = 4, R_, "Analog input current";
            PwmFrequency:              Rtd, 504, width = 2, channels = 1, _W, "PWM frequency set-point";
            PwmDuty:                   Rtd, 506, width = 1, channels = 8, _W, "PWM duty set-point";
            PwmDutyGet:                Rtd, 514, width = 1, channels = 8, R_, "Measured PWM duty";
            PwmFrequencyGet:           Rtd, 522, width = 2, channels = 8, R_, "Measured PWM frequency";
            PwmWidthGet:               Rtd, 538, width = 2, channels = 8, R_, "Measured PWM pulse width";
            RtdResistance:             Rtd, 554, width = 2, channels = 8, R_, "AD7124 RTD resistance";
            Pressure:                  Rtd, 578, width = 1, channels = 32, R_, "RS-485 pressure sensor value (channel = sensor id - 1)";
            Alarm:                     ControlLogic, 2, width = 1, channels = 1, R_, "Control logic alarm status";
            T2Avg:                     ControlLogic, 11, width = 1, channels = 1, R_, "T2 moving average";
            T3Avg:                     ControlLogic, 14, width = 1, channels = 1, R_, "T3 moving average";
            T4Avg:                     ControlLogic, 17, width = 1, channels = 1, R_, "T4 moving average";
            Cl1Enable:                 ControlLogic, 15000, width = 1, channels = 1, RW, "Control logic 1 enable";
            Cl1FanRotationConfig:      ControlLogic, 15001, width = 1, channels = 1, RW, "Control logic 1 fan rotation configuration";
            Cl1TargetCoolantTemp:      ControlLogic, 15002, width = 1, channels = 1, RW, "Control logic 1 target coolant temperature";
            Cl1Tolerance:              ControlLogic, 15003, width = 1, channels = 1, RW, "Control logic 1 tolerance";
            Cl1CriticalHigh:           ControlLogic, 15004, width = 1, channels = 1, RW, "Control logic 1 critical high limit";
            Cl1CriticalLow:            ControlLogic, 15005, width = 1, channels = 1, RW, "Control logic 1 critical low limit";
            Cl1MovingAverageWindowSize: ControlLogic, 15006, width = 1, channels = 1, RW, "Control logic 1 moving average window size";
        }
    };
}

macro_rules! define_functions {
    ($($variant:ident: $board:ident, $base:literal, width = $width:literal, channels = $channels:literal, $mode:ident, $description:literal;)*) => {
        /// A symbolic board function, resolved to a register address via [`Target`].
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash,
            clap::ValueEnum, strum::VariantArray, strum::IntoStaticStr,
        )]
        #[strum(serialize_all = "kebab-case")]
        pub enum Function {
            $(
                #[value(help = $description)]
                $variant,
            )*
        }

        impl Function {
            pub const fn board(self) -> Board {
                match self { $(Self::$variant => Board::$board,)* }
            }

            /// Offset of channel 0 relative to the slot's first register.
            pub const fn base(self) -> u16 {
                match self { $(Self::$variant => $base,)* }
            }

            /// Number of consecutive registers holding one value. Also the channel stride.
            pub const fn width(self) -> u16 {
                match self { $(Self::$variant => $width,)* }
            }

            pub const fn channels(self) -> u16 {
                match self { $(Self::$variant => $channels,)* }
            }

            pub const fn mode(self) -> Mode {
                match self { $(Self::$variant => Mode::$mode,)* }
            }

            pub const fn description(self) -> &'static str {
                match self { $(Self::$variant => $description,)* }
            }
        }
    };
}

for_each_function!(define_functions);

impl Function {
    pub fn name(self) -> &'static str {
        self.into()
    }
}

impl std::fmt::Display for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl serde::Serialize for Function {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// A validated function instance on a specific slot and channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Target {
    function: Function,
    slot: u16,
    channel: u16,
    address: u16,
}

impl Target {
    pub fn new(function: Function, slot: u16, channel: u16) -> Result<Self, Error> {
        if channel >= function.channels() {
            return Err(Error::ChannelOutOfRange {
                function,
                channel,
                channels: function.channels(),
            });
        }
        let address =
            resolve(function.board(), function.base(), slot, channel, function.width())?;
        Ok(Self { function, slot, channel, address })
    }

    /// Pressure sensors are numbered from 1 on the RS-485 side.
    pub fn pressure_sensor(slot: u16, sensor_id: u16) -> Result<Self, Error> {
        let channel = sensor_id.checked_sub(1).ok_or(Error::SensorIdZero)?;
        Self::new(Function::Pressure, slot, channel)
    }

    pub fn function(&self) -> Function {
        self.function
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn width(&self) -> u16 {
        self.function.width()
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[slot {}, channel {}] @ {}",
            self.function, self.slot, self.channel, self.address
        )
    }
}

/// Operating mode of an I/O board analog port, written to [`Function::AnalogMode`].
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    clap::ValueEnum,
    strum::FromRepr,
    strum::IntoStaticStr,
    num_derive::ToPrimitive,
)]
#[strum(serialize_all = "kebab-case")]
#[repr(u16)]
pub enum AnalogMode {
    AoVoltage = 0,
    AoCurrent = 1,
    AiVoltage = 2,
    AiCurrentLoop = 3,
    AiCurrentExt = 4,
}

/// Analog port letter on the I/O board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum AnalogPort {
    A,
    B,
    C,
    D,
}

impl AnalogPort {
    pub const fn channel(self) -> u16 {
        self as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::VariantArray as _;

    #[test]
    fn io_board_digital_output() {
        let target = Target::new(Function::DigitalOutput, 1, 3).unwrap();
        assert_eq!(target.address(), 11104);
    }

    #[test]
    fn rtd_board_pwm_duty() {
        let target = Target::new(Function::PwmDuty, 0, 2).unwrap();
        assert_eq!(target.address(), 11508);
    }

    #[test]
    fn double_width_functions_use_stride_two() {
        assert_eq!(Target::new(Function::AiVoltage, 0, 0).unwrap().address(), 11053);
        assert_eq!(Target::new(Function::AiVoltage, 0, 3).unwrap().address(), 11059);
        assert_eq!(Target::new(Function::AoCurrent, 2, 1).unwrap().address(), 11247);
        assert_eq!(Target::new(Function::RtdResistance, 3, 7).unwrap().address(), 14568);
        assert_eq!(Target::new(Function::PwmFrequency, 1, 0).unwrap().address(), 12504);
    }

    #[test]
    fn control_logic_registers_are_absolute() {
        assert_eq!(Target::new(Function::Alarm, 0, 0).unwrap().address(), 2);
        assert_eq!(Target::new(Function::T4Avg, 0, 0).unwrap().address(), 17);
        assert_eq!(
            Target::new(Function::Cl1MovingAverageWindowSize, 0, 0).unwrap().address(),
            15006
        );
        assert_eq!(
            Target::new(Function::Alarm, 1, 0),
            Err(Error::SlotOutOfRange { board: Board::ControlLogic, slot: 1, slots: 1 })
        );
    }

    #[test]
    fn pressure_sensor_ids_are_one_based() {
        assert_eq!(Target::pressure_sensor(0, 1).unwrap().address(), 11578);
        assert_eq!(Target::pressure_sensor(0, 32).unwrap().address(), 11609);
        assert_eq!(Target::pressure_sensor(0, 0), Err(Error::SensorIdZero));
        assert!(matches!(
            Target::pressure_sensor(0, 33),
            Err(Error::ChannelOutOfRange { channel: 32, channels: 32, .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_indices() {
        assert_eq!(
            Target::new(Function::DigitalInput, 4, 0),
            Err(Error::SlotOutOfRange { board: Board::Io, slot: 4, slots: 4 })
        );
        assert_eq!(
            Target::new(Function::DigitalInput, 0, 8),
            Err(Error::ChannelOutOfRange {
                function: Function::DigitalInput,
                channel: 8,
                channels: 8
            })
        );
        assert!(Target::new(Function::PwmFrequency, 0, 1).is_err());
    }

    #[test]
    fn resolve_reports_address_overflow() {
        assert_eq!(
            resolve(Board::ControlLogic, 65535, 0, 1, 1),
            Err(Error::AddressOverflow(65536))
        );
        assert_eq!(resolve(Board::Rtd, 0, 3, 0, 1), Ok(14000));
    }

    #[test]
    fn addresses_are_injective_per_function() {
        for &function in Function::VARIANTS {
            let layout = function.board().layout();
            let mut seen = std::collections::BTreeSet::new();
            for slot in 0..layout.slots {
                for channel in 0..function.channels() {
                    let target = Target::new(function, slot, channel).unwrap();
                    // Both words of a wide value must belong to this channel only.
                    for word in 0..function.width() {
                        assert!(
                            seen.insert(target.address() + word),
                            "{function} overlaps itself at slot {slot} channel {channel}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn function_names_are_kebab_case() {
        assert_eq!(Function::DigitalOutput.name(), "digital-output");
        assert_eq!(Function::T2Avg.name(), "t2-avg");
        assert_eq!(Function::Cl1Enable.name(), "cl1-enable");
        assert_eq!(Board::ControlLogic.to_string(), "control logic");
    }

    #[test]
    fn analog_mode_values() {
        use num_traits::ToPrimitive as _;
        assert_eq!(AnalogMode::AoVoltage.to_u16(), Some(0));
        assert_eq!(AnalogMode::AiCurrentExt.to_u16(), Some(4));
        assert_eq!(AnalogMode::from_repr(3), Some(AnalogMode::AiCurrentLoop));
        assert_eq!(AnalogPort::C.channel(), 2);
    }

    #[test]
    fn modes() {
        assert_eq!(Function::DigitalInput.mode().to_string(), "R-");
        assert_eq!(Function::PwmDuty.mode().to_string(), "-W");
        assert_eq!(Function::Cl1Enable.mode().to_string(), "RW");
        assert!(!Function::AiCurrent.mode().writable());
    }
}
