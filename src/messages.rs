#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HotplugAction {
    Add,
    Remove,
}

/// A raw udev event as seen by the listener thread, before any identity
/// filtering. Property values are copied out so the event can cross the
/// channel without borrowing the udev device.
#[derive(Clone, Debug)]
pub struct RawHotplugEvent {
    pub action: HotplugAction,
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    pub is_usb: bool,
    pub is_keyboard: bool,
}
